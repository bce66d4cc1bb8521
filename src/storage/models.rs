//! Database models for Guideline Core.
//!
//! These are the row types returned by SQLx queries.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{AuditRecord, RequesterContext, RuleDescriptor};
use crate::error::EngineError;

fn parse_uuid(value: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(value).map_err(|e| EngineError::Internal(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Internal(e.to_string()))
}

/// Database row for audit_records table.
#[derive(Debug, Clone, FromRow)]
pub struct AuditRecordRow {
    pub id: String,
    pub idempotency_key: String,
    pub fingerprint: String,
    pub kind: String,
    pub excerpt: Option<String>,
    pub decision: String,
    pub registry_version: String,
    pub verdict: String,
    pub cache_hit: bool,
    pub requester_id: String,
    pub session_ref: Option<String>,
    pub requested_at: String,
    pub recorded_at: String,
}

impl TryFrom<AuditRecordRow> for AuditRecord {
    type Error = EngineError;

    fn try_from(row: AuditRecordRow) -> Result<Self, Self::Error> {
        let verdict = serde_json::from_str(&row.verdict)?;

        Ok(AuditRecord {
            id: parse_uuid(&row.id)?,
            idempotency_key: parse_uuid(&row.idempotency_key)?,
            fingerprint: crate::domain::Fingerprint::from_hex(row.fingerprint),
            kind: row.kind.parse().map_err(EngineError::Internal)?,
            excerpt: row.excerpt,
            verdict,
            cache_hit: row.cache_hit,
            requester: RequesterContext {
                requester_id: row.requester_id,
                session_ref: row.session_ref,
            },
            requested_at: parse_timestamp(&row.requested_at)?,
            recorded_at: parse_timestamp(&row.recorded_at)?,
        })
    }
}

/// Database row for guideline_rules table.
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    pub key: String,
    pub version: i64,
    pub body: String,
    pub active: bool,
    pub created_at: String,
}

impl TryFrom<RuleRow> for RuleDescriptor {
    type Error = EngineError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let descriptor: RuleDescriptor = serde_json::from_str(&row.body)?;

        if descriptor.key != row.key || i64::from(descriptor.version) != row.version {
            return Err(EngineError::Internal(format!(
                "Rule row {}@{} holds descriptor {}@{}",
                row.key, row.version, descriptor.key, descriptor.version
            )));
        }

        Ok(descriptor)
    }
}
