//! Content Normalizer - canonicalizes input and computes fingerprints.
//!
//! Normalization is pure: identical normalized output always yields the
//! same fingerprint, which keys both the verdict cache and audit records.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::domain::{
    ContentItem, ContentKind, Fingerprint, NormalizedBody, NormalizedContent,
};
use crate::error::{EngineError, EngineResult};

/// Canonicalizes content and fingerprints it.
#[derive(Debug, Clone)]
pub struct ContentNormalizer {
    max_text_chars: usize,
    max_prompt_chars: usize,
    max_image_bytes: usize,
    max_image_dimension: u32,
}

impl ContentNormalizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_text_chars: config.max_text_chars,
            max_prompt_chars: config.max_prompt_chars,
            max_image_bytes: config.max_image_bytes,
            max_image_dimension: config.max_image_dimension.max(1),
        }
    }

    /// Normalize a content item and compute its fingerprint.
    pub fn normalize(&self, item: &ContentItem) -> EngineResult<(NormalizedContent, Fingerprint)> {
        let body = match item.kind {
            ContentKind::Text => NormalizedBody::Text(self.normalize_text(&item.payload)?),
            ContentKind::Image => self.normalize_image(&item.payload, &item.media_type)?,
        };

        let prompt = match item.prompt.as_deref() {
            Some(raw) => self.normalize_prompt(raw)?,
            None => None,
        };

        let content = NormalizedContent {
            kind: item.kind,
            body,
            prompt,
        };
        let fingerprint = fingerprint(&content);

        Ok((content, fingerprint))
    }

    fn normalize_text(&self, payload: &[u8]) -> EngineResult<String> {
        // A char is at most four bytes, so this bounds work before decoding.
        if payload.len() > self.max_text_chars.saturating_mul(4) {
            return Err(self.text_too_large());
        }

        let raw = std::str::from_utf8(payload)
            .map_err(|e| EngineError::InvalidInput(format!("text is not valid UTF-8: {}", e)))?;

        let text = collapse_whitespace(raw);
        if text.is_empty() {
            return Err(EngineError::InvalidInput(
                "text is empty after normalization".to_string(),
            ));
        }
        if text.chars().count() > self.max_text_chars {
            return Err(self.text_too_large());
        }

        Ok(text)
    }

    fn normalize_prompt(&self, raw: &str) -> EngineResult<Option<String>> {
        if raw.len() > self.max_prompt_chars.saturating_mul(4) {
            return Err(self.prompt_too_large());
        }

        let prompt = collapse_whitespace(raw);
        if prompt.chars().count() > self.max_prompt_chars {
            return Err(self.prompt_too_large());
        }

        Ok(Some(prompt).filter(|p| !p.is_empty()))
    }

    fn prompt_too_large(&self) -> EngineError {
        EngineError::ContentTooLarge(format!(
            "prompt exceeds {} characters",
            self.max_prompt_chars
        ))
    }

    fn text_too_large(&self) -> EngineError {
        EngineError::ContentTooLarge(format!(
            "text exceeds {} characters",
            self.max_text_chars
        ))
    }

    fn normalize_image(&self, payload: &[u8], media_type: &str) -> EngineResult<NormalizedBody> {
        if payload.len() > self.max_image_bytes {
            return Err(EngineError::ContentTooLarge(format!(
                "image exceeds {} bytes",
                self.max_image_bytes
            )));
        }

        let format = image_format(media_type)?;
        let decoded = image::load_from_memory_with_format(payload, format).map_err(|e| {
            EngineError::UnsupportedMediaType(format!(
                "could not decode image as {}: {}",
                media_type, e
            ))
        })?;

        let max = self.max_image_dimension;
        let bounded = if decoded.width() > max || decoded.height() > max {
            decoded.resize(max, max, FilterType::Lanczos3)
        } else {
            decoded
        };

        let canonical = DynamicImage::ImageRgba8(bounded.to_rgba8());
        let mut png = Vec::new();
        canonical
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EngineError::Internal(format!("PNG re-encoding failed: {}", e)))?;

        Ok(NormalizedBody::Image {
            png,
            width: canonical.width(),
            height: canonical.height(),
        })
    }
}

/// Map a declared media type to a decodable image format.
fn image_format(media_type: &str) -> EngineResult<ImageFormat> {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/bmp" => Ok(ImageFormat::Bmp),
        _ => Err(EngineError::UnsupportedMediaType(format!(
            "media type '{}' is not supported",
            media_type
        ))),
    }
}

/// Characters invisible in rendering that would otherwise split fingerprints.
fn is_invisible(ch: char) -> bool {
    matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Drop control characters, collapse whitespace runs to one space, trim.
fn collapse_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if ch.is_control() || is_invisible(ch) {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }

    out
}

/// SHA-256 over the kind tag, the canonical bytes and the prompt.
///
/// Each part is length-prefixed so no two inputs share an encoding.
fn fingerprint(content: &NormalizedContent) -> Fingerprint {
    let mut hasher = Sha256::new();

    let mut part = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    };

    part(content.kind.tag().as_bytes());
    part(content.canonical_bytes());
    if let Some(prompt) = &content.prompt {
        part(prompt.as_bytes());
    }

    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}
