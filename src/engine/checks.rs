//! Guideline checks - the single capability every rule implements.
//!
//! Keyword matching, heuristics and classifier calls are interchangeable
//! variants behind [`GuidelineCheck`]. A check reports an outcome; the
//! evaluator stamps the rule key and version onto the finding.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{CheckSpec, NormalizedContent, Outcome};
use crate::engine::llm_guard::{LlamaGuardCheck, LlamaGuardClient};
use crate::error::{EngineError, EngineResult};

/// Confidence reported for a keyword hit.
const KEYWORD_HIT_CONFIDENCE: f64 = 0.8;

/// Outcome of one check before it is attributed to a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub outcome: Outcome,
    pub confidence: f64,
    pub reason: String,
}

impl CheckResult {
    pub fn new(outcome: Outcome, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            confidence,
            reason: reason.into(),
        }
    }

    pub fn pass(confidence: f64, reason: impl Into<String>) -> Self {
        Self::new(Outcome::Pass, confidence, reason)
    }
}

/// Capability interface for a guideline check.
#[async_trait]
pub trait GuidelineCheck: Send + Sync {
    /// Evaluate normalized content. Errors become `error` findings.
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult>;
}

/// Term-matching check over content text and prompt.
pub struct KeywordCheck {
    terms: Vec<String>,
    outcome: Outcome,
}

impl KeywordCheck {
    pub fn new(terms: Vec<String>, outcome: Outcome) -> Self {
        let terms = terms
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { terms, outcome }
    }

    /// Terms present in the text (case-insensitive).
    fn hits(&self, text: &str) -> Vec<&str> {
        let text_lower = text.to_lowercase();
        self.terms
            .iter()
            .filter(|term| text_lower.contains(term.as_str()))
            .map(String::as_str)
            .collect()
    }
}

#[async_trait]
impl GuidelineCheck for KeywordCheck {
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult> {
        let text = content.scannable_text();
        let hits = self.hits(&text);

        if hits.is_empty() {
            return Ok(CheckResult::pass(1.0, "No listed terms found"));
        }

        Ok(CheckResult::new(
            self.outcome,
            KEYWORD_HIT_CONFIDENCE,
            format!("Listed terms found: {}", hits.join(", ")),
        ))
    }
}

/// Length-based overlap heuristic for text.
pub struct LengthRatioCheck {
    divisor: f64,
    flag_at: f64,
    fail_at: f64,
}

impl LengthRatioCheck {
    pub fn new(divisor: f64, flag_at: f64, fail_at: f64) -> Self {
        Self {
            divisor,
            flag_at,
            fail_at,
        }
    }
}

#[async_trait]
impl GuidelineCheck for LengthRatioCheck {
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult> {
        let text = content.text().ok_or_else(|| {
            EngineError::RuleExecution("length ratio check needs text content".to_string())
        })?;

        let chars = text.chars().count() as f64;
        let score = (chars / self.divisor).min(1.0);

        let result = if score >= self.fail_at {
            CheckResult::new(
                Outcome::Fail,
                score,
                format!("Overlap ratio {:.2} at or above {:.2}", score, self.fail_at),
            )
        } else if score >= self.flag_at {
            CheckResult::new(
                Outcome::Flag,
                score,
                format!("Overlap ratio {:.2} at or above {:.2}", score, self.flag_at),
            )
        } else {
            CheckResult::pass(1.0 - score, format!("Overlap ratio {:.2}", score))
        };

        Ok(result)
    }
}

/// Flags images too small to review meaningfully.
pub struct ImageBoundsCheck {
    min_edge: u32,
}

impl ImageBoundsCheck {
    pub fn new(min_edge: u32) -> Self {
        Self { min_edge }
    }
}

#[async_trait]
impl GuidelineCheck for ImageBoundsCheck {
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult> {
        let (width, height) = content.image_dimensions().ok_or_else(|| {
            EngineError::RuleExecution("image bounds check needs image content".to_string())
        })?;

        if width.min(height) < self.min_edge {
            return Ok(CheckResult::new(
                Outcome::Flag,
                0.6,
                format!(
                    "Image {}x{} is below the {}px minimum edge",
                    width, height, self.min_edge
                ),
            ));
        }

        Ok(CheckResult::pass(1.0, format!("Image {}x{}", width, height)))
    }
}

/// Scores images by whether the generating prompt was disclosed.
pub struct PromptDisclosureCheck {
    with_prompt: f64,
    without_prompt: f64,
    flag_at: f64,
}

impl PromptDisclosureCheck {
    pub fn new(with_prompt: f64, without_prompt: f64, flag_at: f64) -> Self {
        Self {
            with_prompt,
            without_prompt,
            flag_at,
        }
    }
}

#[async_trait]
impl GuidelineCheck for PromptDisclosureCheck {
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult> {
        let (score, source) = if content.prompt.is_some() {
            (self.with_prompt, "with prompt")
        } else {
            (self.without_prompt, "without prompt")
        };

        if score >= self.flag_at {
            return Ok(CheckResult::new(
                Outcome::Flag,
                score,
                format!("Similarity distance {:.2} ({}) needs review", score, source),
            ));
        }

        Ok(CheckResult::pass(
            1.0 - score,
            format!("Similarity distance {:.2} ({})", score, source),
        ))
    }
}

/// Builds executable checks from descriptors.
#[derive(Clone, Default)]
pub struct CheckFactory {
    classifier: Option<LlamaGuardClient>,
}

impl CheckFactory {
    pub fn new(classifier: Option<LlamaGuardClient>) -> Self {
        Self { classifier }
    }

    pub fn build(&self, spec: &CheckSpec) -> Arc<dyn GuidelineCheck> {
        match spec {
            CheckSpec::Keyword { terms, outcome } => {
                Arc::new(KeywordCheck::new(terms.clone(), *outcome))
            }
            CheckSpec::LengthRatio {
                divisor,
                flag_at,
                fail_at,
            } => Arc::new(LengthRatioCheck::new(*divisor, *flag_at, *fail_at)),
            CheckSpec::ImageBounds { min_edge } => Arc::new(ImageBoundsCheck::new(*min_edge)),
            CheckSpec::PromptDisclosure {
                with_prompt,
                without_prompt,
                flag_at,
            } => Arc::new(PromptDisclosureCheck::new(
                *with_prompt,
                *without_prompt,
                *flag_at,
            )),
            CheckSpec::LlmGuard { model } => {
                Arc::new(LlamaGuardCheck::new(self.classifier.clone(), model.clone()))
            }
        }
    }
}
