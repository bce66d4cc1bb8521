//! Verdict-related domain types.
//!
//! Represents the engine's decision for one evaluated content item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ContentKind, Fingerprint};

/// Outcome of a single rule against a single content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Flag,
    Fail,
    /// The rule could not be executed.
    Error,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::Flag => write!(f, "flag"),
            Outcome::Fail => write!(f, "fail"),
            Outcome::Error => write!(f, "error"),
        }
    }
}

/// Overall decision for a verdict.
///
/// Variants are declared from least to most strict, so `max` picks the
/// stricter decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    NeedsReview,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::NeedsReview => write!(f, "needs_review"),
            Decision::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "approve" => Ok(Decision::Approve),
            "needs_review" => Ok(Decision::NeedsReview),
            "reject" => Ok(Decision::Reject),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// One rule's outcome for one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Finding {
    pub rule_key: String,
    pub rule_version: u32,
    pub outcome: Outcome,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Human-readable reason.
    pub reason: String,
}

impl Finding {
    pub fn new(
        rule_key: impl Into<String>,
        rule_version: u32,
        outcome: Outcome,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            rule_key: rule_key.into(),
            rule_version,
            outcome,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
        }
    }

    /// Finding recorded when a rule failed to execute.
    pub fn error(rule_key: impl Into<String>, rule_version: u32, reason: impl Into<String>) -> Self {
        Self::new(rule_key, rule_version, Outcome::Error, 0.0, reason)
    }
}

/// Aggregated decision across all findings for one evaluation.
///
/// Immutable once produced; cached and audited by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Verdict {
    /// Unique identifier for this verdict.
    pub id: Uuid,

    pub decision: Decision,

    /// Aggregate confidence in [0, 1].
    pub confidence: f64,

    /// Severity-weighted risk total in [0, 1].
    pub risk_score: f64,

    pub findings: Vec<Finding>,

    /// Version of the rule set that produced this verdict.
    pub registry_version: String,

    pub fingerprint: Fingerprint,

    pub kind: ContentKind,

    pub created_at: DateTime<Utc>,
}
