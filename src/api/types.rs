//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::domain::{AuditRecord, RequesterContext, RuleDescriptor, Verdict};

// ==================== Checks ====================

/// Request to check generated text.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckTextRequest {
    /// The generated text.
    pub text: String,
    /// Prompt that produced the text, if known.
    #[serde(default)]
    pub prompt: Option<String>,
    pub requester_context: RequesterContext,
}

/// Request to check a generated image.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckImageRequest {
    /// Base64-encoded image bytes (standard alphabet, padded).
    #[serde(default)]
    pub image_base64: Option<String>,
    /// Remote image reference. Not supported; send `image_base64`.
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Declared media type, e.g. `image/png`.
    pub media_type: String,
    /// Prompt that produced the image, if known.
    #[serde(default)]
    pub prompt: Option<String>,
    pub requester_context: RequesterContext,
}

/// Result of a check.
#[derive(Debug, Serialize, ToSchema)]
pub struct CheckResponse {
    pub verdict: Verdict,
    /// Audit record the approval workflow should reference.
    pub audit_record_id: Uuid,
    /// Whether the verdict came from the cache.
    pub cache_hit: bool,
}

// ==================== Audit ====================

/// Query parameters for listing audit records.
#[derive(Debug, Deserialize, ToSchema, IntoParams)]
pub struct ListAuditQuery {
    /// Filter by requester.
    #[serde(default)]
    pub requester_id: Option<String>,
    /// Filter by decision: approve, needs_review, reject.
    #[serde(default)]
    pub decision: Option<String>,
    /// Maximum number of results.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination.
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Response for listing audit records.
#[derive(Debug, Serialize, ToSchema)]
pub struct ListAuditResponse {
    pub records: Vec<AuditRecord>,
    /// Total matching records (for pagination).
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// ==================== Registry ====================

/// A rule in the current snapshot.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegistryRule {
    #[serde(flatten)]
    pub descriptor: RuleDescriptor,
    /// Threshold in force after configuration overrides.
    pub effective_threshold: f64,
}

/// The rule set new checks are evaluated against.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegistryResponse {
    pub version: String,
    pub loaded_at: DateTime<Utc>,
    pub rules: Vec<RegistryRule>,
}

// ==================== Health ====================

/// Liveness response. Always an empty object.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {}

/// Detailed health for operators.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthDetails {
    /// `healthy` or `degraded`.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Database connectivity.
    pub database: String,
    /// Current rule-set version, if one is loaded.
    pub registry_version: Option<String>,
    /// Audit records dropped since startup.
    pub audit_dropped: u64,
    pub timestamp: String,
}
