//! Audit record domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ContentKind, Decision, Fingerprint, RequesterContext, Verdict};

/// Append-only record of one completed check.
///
/// The external approval workflow links its own decisions to `id`; the
/// engine never updates or deletes a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AuditRecord {
    pub id: Uuid,

    /// Request-scoped key that deduplicates retried writes.
    pub idempotency_key: Uuid,

    pub fingerprint: Fingerprint,

    pub kind: ContentKind,

    /// Redacted excerpt of the normalized content (text only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,

    pub verdict: Verdict,

    /// Whether the verdict was served from the cache.
    pub cache_hit: bool,

    pub requester: RequesterContext,

    /// When the check request arrived.
    pub requested_at: DateTime<Utc>,

    /// When this record was created.
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        verdict: Verdict,
        excerpt: Option<String>,
        cache_hit: bool,
        requester: RequesterContext,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4(),
            fingerprint: verdict.fingerprint.clone(),
            kind: verdict.kind,
            excerpt,
            verdict,
            cache_hit,
            requester,
            requested_at,
            recorded_at: Utc::now(),
        }
    }
}

/// Filters for listing audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub requester_id: Option<String>,
    pub decision: Option<Decision>,
}
