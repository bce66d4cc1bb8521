//! Content-related domain types.
//!
//! Represents what a caller submits for checking and its canonical form.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kind of content being checked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
}

impl ContentKind {
    /// Tag mixed into fingerprints so text and image digests never collide.
    pub fn tag(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            _ => Err(format!("Unknown content kind: {}", s)),
        }
    }
}

/// Raw content submitted for a check.
///
/// Lives only for the duration of one request and is never persisted.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub kind: ContentKind,
    pub payload: Vec<u8>,
    pub media_type: String,
    /// Generation prompt that produced the content, if the caller has one.
    pub prompt: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            payload: text.into().into_bytes(),
            media_type: "text/plain; charset=utf-8".to_string(),
            prompt,
        }
    }

    pub fn image(bytes: Vec<u8>, media_type: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            kind: ContentKind::Image,
            payload: bytes,
            media_type: media_type.into(),
            prompt,
        }
    }
}

/// Deterministic digest of normalized content (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical body of normalized content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedBody {
    Text(String),
    /// Canonical PNG encoding plus its dimensions.
    Image { png: Vec<u8>, width: u32, height: u32 },
}

/// Content after normalization, shared read-only by all rules of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedContent {
    pub kind: ContentKind,
    pub body: NormalizedBody,
    pub prompt: Option<String>,
}

/// Maximum characters kept in a stored excerpt.
const EXCERPT_CHARS: usize = 120;

impl NormalizedContent {
    /// Normalized text, if this is text content.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            NormalizedBody::Text(text) => Some(text),
            NormalizedBody::Image { .. } => None,
        }
    }

    /// Canonical image dimensions, if this is image content.
    pub fn image_dimensions(&self) -> Option<(u32, u32)> {
        match &self.body {
            NormalizedBody::Image { width, height, .. } => Some((*width, *height)),
            NormalizedBody::Text(_) => None,
        }
    }

    /// Bytes the fingerprint is computed over.
    pub fn canonical_bytes(&self) -> &[u8] {
        match &self.body {
            NormalizedBody::Text(text) => text.as_bytes(),
            NormalizedBody::Image { png, .. } => png,
        }
    }

    /// Text a rule may scan: the content itself and any accompanying prompt.
    pub fn scannable_text(&self) -> String {
        let mut text = String::new();
        if let Some(body) = self.text() {
            text.push_str(body);
        }
        if let Some(prompt) = &self.prompt {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(prompt);
        }
        text
    }

    /// Redacted excerpt safe to store with an audit record.
    ///
    /// Image bytes are never stored; text is truncated.
    pub fn excerpt(&self) -> Option<String> {
        let text = self.text()?;
        let mut excerpt: String = text.chars().take(EXCERPT_CHARS).collect();
        if text.chars().count() > EXCERPT_CHARS {
            excerpt.push('…');
        }
        Some(excerpt)
    }
}

/// Who asked for a check, as referenced by the web application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequesterContext {
    /// Opaque reference to the requesting user.
    pub requester_id: String,
    /// Optional session reference from the web application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ref: Option<String>,
}

impl RequesterContext {
    pub fn new(requester_id: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            session_ref: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_round_trip() {
        assert_eq!("TEXT".parse::<ContentKind>().unwrap(), ContentKind::Text);
        assert_eq!(ContentKind::Image.to_string(), "image");
        assert!("video".parse::<ContentKind>().is_err());
    }

    #[test]
    fn test_excerpt_truncates_long_text() {
        let content = NormalizedContent {
            kind: ContentKind::Text,
            body: NormalizedBody::Text("a".repeat(300)),
            prompt: None,
        };

        let excerpt = content.excerpt().unwrap();
        assert_eq!(excerpt.chars().count(), EXCERPT_CHARS + 1);
        assert!(excerpt.ends_with('…'));
    }

    #[test]
    fn test_image_has_no_excerpt() {
        let content = NormalizedContent {
            kind: ContentKind::Image,
            body: NormalizedBody::Image {
                png: vec![1, 2, 3],
                width: 1,
                height: 1,
            },
            prompt: Some("a cat".to_string()),
        };

        assert!(content.excerpt().is_none());
        assert_eq!(content.scannable_text(), "a cat");
    }
}
