//! Guideline rule descriptors.
//!
//! A descriptor is the published, immutable definition of a check. Changing
//! a rule means publishing a new `(key, version)` pair.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ContentKind, Outcome};
use crate::error::{EngineError, EngineResult};

fn default_keyword_outcome() -> Outcome {
    Outcome::Flag
}

/// NaN is never in range.
fn in_unit_range(scores: &[f64]) -> bool {
    scores.iter().all(|s| (0.0..=1.0).contains(s))
}

/// Tagged specification of what a rule checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    /// Case-insensitive term match over text and prompt.
    Keyword {
        terms: Vec<String>,
        #[serde(default = "default_keyword_outcome")]
        outcome: Outcome,
    },
    /// Length-based overlap heuristic: score = min(chars / divisor, 1).
    LengthRatio {
        divisor: f64,
        flag_at: f64,
        fail_at: f64,
    },
    /// Flags images whose shorter edge is below `min_edge` pixels.
    ImageBounds { min_edge: u32 },
    /// Scores images by whether a generation prompt was disclosed.
    PromptDisclosure {
        with_prompt: f64,
        without_prompt: f64,
        flag_at: f64,
    },
    /// Llama Guard classifier call.
    LlmGuard { model: String },
}

/// A named, versioned guideline check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleDescriptor {
    /// Stable identifier.
    pub key: String,
    pub version: u32,
    /// Content kinds this rule applies to.
    pub kinds: Vec<ContentKind>,
    /// Weight in the risk score.
    pub severity_weight: f64,
    /// A `fail` finding rejects only when its confidence is above this.
    pub threshold: f64,
    pub check: CheckSpec,
}

impl RuleDescriptor {
    pub fn applies_to(&self, kind: ContentKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Reject descriptors that could never evaluate sensibly.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| -> EngineResult<()> {
            Err(EngineError::Config(format!(
                "rule {}@{}: {}",
                self.key, self.version, msg
            )))
        };

        if self.key.trim().is_empty() {
            return invalid("key must not be empty");
        }
        if self.kinds.is_empty() {
            return invalid("at least one content kind is required");
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid("threshold must be within [0, 1]");
        }
        if !self.severity_weight.is_finite() || self.severity_weight < 0.0 {
            return invalid("severity weight must be a non-negative number");
        }

        match &self.check {
            CheckSpec::Keyword { terms, outcome } => {
                if terms.iter().all(|t| t.trim().is_empty()) {
                    return invalid("keyword rule needs at least one term");
                }
                if !matches!(outcome, Outcome::Flag | Outcome::Fail) {
                    return invalid("keyword outcome must be flag or fail");
                }
            }
            CheckSpec::LengthRatio {
                divisor,
                flag_at,
                fail_at,
            } => {
                if !divisor.is_finite() || *divisor <= 0.0 {
                    return invalid("divisor must be positive");
                }
                if !in_unit_range(&[*flag_at, *fail_at]) {
                    return invalid("flag_at and fail_at must be within [0, 1]");
                }
                if flag_at > fail_at {
                    return invalid("flag_at must not exceed fail_at");
                }
            }
            CheckSpec::ImageBounds { .. } => {
                if self.kinds.contains(&ContentKind::Text) {
                    return invalid("image checks cannot apply to text");
                }
            }
            CheckSpec::PromptDisclosure {
                with_prompt,
                without_prompt,
                flag_at,
            } => {
                if self.kinds.contains(&ContentKind::Text) {
                    return invalid("image checks cannot apply to text");
                }
                if !in_unit_range(&[*with_prompt, *without_prompt, *flag_at]) {
                    return invalid("disclosure scores must be within [0, 1]");
                }
            }
            CheckSpec::LlmGuard { model } => {
                if model.trim().is_empty() {
                    return invalid("classifier model must be named");
                }
            }
        }

        Ok(())
    }

    /// Built-in rule set used when no rules are configured.
    pub fn defaults() -> Vec<RuleDescriptor> {
        vec![
            RuleDescriptor {
                key: "moderation.banned_terms".to_string(),
                version: 1,
                kinds: vec![ContentKind::Text, ContentKind::Image],
                severity_weight: 0.10,
                threshold: 0.7,
                check: CheckSpec::Keyword {
                    terms: ["殺害", "テロ", "差別", "違法", "児童", "暴力"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    outcome: Outcome::Fail,
                },
            },
            RuleDescriptor {
                key: "originality.length_ratio".to_string(),
                version: 1,
                kinds: vec![ContentKind::Text],
                severity_weight: 0.40,
                // Length alone routes to review, never to rejection.
                threshold: 1.0,
                check: CheckSpec::LengthRatio {
                    divisor: 2000.0,
                    flag_at: 0.875,
                    fail_at: 1.0,
                },
            },
            RuleDescriptor {
                key: "image.min_bounds".to_string(),
                version: 1,
                kinds: vec![ContentKind::Image],
                severity_weight: 0.20,
                threshold: 0.8,
                check: CheckSpec::ImageBounds { min_edge: 16 },
            },
            RuleDescriptor {
                key: "image.prompt_disclosure".to_string(),
                version: 1,
                kinds: vec![ContentKind::Image],
                severity_weight: 0.30,
                threshold: 0.9,
                check: CheckSpec::PromptDisclosure {
                    with_prompt: 0.45,
                    without_prompt: 0.30,
                    flag_at: 0.5,
                },
            },
        ]
    }
}
