//! Repository layer for database operations.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use crate::domain::{AuditFilter, AuditRecord, RuleDescriptor};
use crate::engine::{AuditStore, RuleSource};
use crate::error::{EngineError, EngineResult};
use crate::storage::models::{AuditRecordRow, RuleRow};

/// Repository for all Guideline database operations.
#[derive(Clone)]
pub struct EngineRepository {
    pool: SqlitePool,
}

impl EngineRepository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                fingerprint TEXT NOT NULL,
                kind TEXT NOT NULL,
                excerpt TEXT,
                decision TEXT NOT NULL,
                registry_version TEXT NOT NULL,
                verdict TEXT NOT NULL,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                requester_id TEXT NOT NULL,
                session_ref TEXT,
                requested_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_records_fingerprint ON audit_records(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_audit_records_requester ON audit_records(requester_id);
            CREATE INDEX IF NOT EXISTS idx_audit_records_decision ON audit_records(decision);
            CREATE INDEX IF NOT EXISTS idx_audit_records_recorded_at ON audit_records(recorded_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guideline_rules (
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                PRIMARY KEY (key, version)
            );

            CREATE INDEX IF NOT EXISTS idx_guideline_rules_active ON guideline_rules(active);
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database schema initialized");
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Audit Records ====================

    /// Insert an audit record. Returns `false` if a record with the same
    /// idempotency key already exists.
    pub async fn insert_audit_record(&self, record: &AuditRecord) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, idempotency_key, fingerprint, kind, excerpt,
                decision, registry_version, verdict, cache_hit,
                requester_id, session_ref, requested_at, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.idempotency_key.to_string())
        .bind(record.fingerprint.as_str())
        .bind(record.kind.to_string())
        .bind(&record.excerpt)
        .bind(record.verdict.decision.to_string())
        .bind(&record.verdict.registry_version)
        .bind(serde_json::to_string(&record.verdict)?)
        .bind(record.cache_hit)
        .bind(&record.requester.requester_id)
        .bind(&record.requester.session_ref)
        .bind(record.requested_at.to_rfc3339())
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get an audit record by ID.
    pub async fn get_audit_record(&self, id: Uuid) -> EngineResult<AuditRecord> {
        let row: AuditRecordRow = sqlx::query_as("SELECT * FROM audit_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Audit record {} not found", id)))?;

        row.try_into()
    }

    /// List audit records, newest first, with the total matching count.
    pub async fn list_audit_records(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> EngineResult<(Vec<AuditRecord>, i64)> {
        let mut conditions = vec!["1 = 1".to_string()];

        if filter.requester_id.is_some() {
            conditions.push("requester_id = ?".to_string());
        }
        if filter.decision.is_some() {
            conditions.push("decision = ?".to_string());
        }

        let where_clause = conditions.join(" AND ");

        let query = format!(
            r#"
            SELECT *
            FROM audit_records
            WHERE {}
            ORDER BY recorded_at DESC, id
            LIMIT ? OFFSET ?
            "#,
            where_clause
        );

        let count_query = format!(
            r#"SELECT COUNT(*) FROM audit_records WHERE {}"#,
            where_clause
        );

        let mut query_builder = sqlx::query_as::<_, AuditRecordRow>(&query);
        let mut count_builder = sqlx::query_as::<_, (i64,)>(&count_query);

        if let Some(requester) = &filter.requester_id {
            query_builder = query_builder.bind(requester.clone());
            count_builder = count_builder.bind(requester.clone());
        }
        if let Some(decision) = filter.decision {
            query_builder = query_builder.bind(decision.to_string());
            count_builder = count_builder.bind(decision.to_string());
        }

        query_builder = query_builder.bind(limit).bind(offset);

        let rows = query_builder.fetch_all(&self.pool).await?;
        let (total,) = count_builder.fetch_one(&self.pool).await?;

        let records = rows
            .into_iter()
            .map(|r| r.try_into())
            .collect::<EngineResult<Vec<_>>>()?;

        Ok((records, total))
    }

    // ==================== Guideline Rules ====================

    /// Publish a rule version and make it the active one for its key.
    pub async fn publish_rule(&self, rule: &RuleDescriptor) -> EngineResult<()> {
        let version = i64::from(rule.version);
        let mut tx = self.pool.begin().await?;

        let existing: Option<RuleRow> =
            sqlx::query_as("SELECT * FROM guideline_rules WHERE key = ? AND version = ?")
                .bind(&rule.key)
                .bind(version)
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some(row) => {
                let stored = RuleDescriptor::try_from(row)?;
                if stored != *rule {
                    return Err(EngineError::InvalidInput(format!(
                        "Rule {}@{} is already published with a different definition; \
                         publish a new version instead",
                        rule.key, rule.version
                    )));
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO guideline_rules (key, version, body, active, created_at)
                    VALUES (?, ?, ?, 0, ?)
                    "#,
                )
                .bind(&rule.key)
                .bind(version)
                .bind(serde_json::to_string(rule)?)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;

                tracing::info!(key = %rule.key, version = rule.version, "Published guideline rule");
            }
        }

        sqlx::query(
            r#"
            UPDATE guideline_rules
            SET active = CASE WHEN version = ? THEN 1 ELSE 0 END
            WHERE key = ?
            "#,
        )
        .bind(version)
        .bind(&rule.key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Deactivate every active rule not listed in `keep`.
    pub async fn retire_rules_except(&self, keep: &[RuleDescriptor]) -> EngineResult<u64> {
        let keep: HashSet<(&str, i64)> = keep
            .iter()
            .map(|r| (r.key.as_str(), i64::from(r.version)))
            .collect();

        let mut tx = self.pool.begin().await?;

        let active: Vec<(String, i64)> =
            sqlx::query_as("SELECT key, version FROM guideline_rules WHERE active = 1")
                .fetch_all(&mut *tx)
                .await?;

        let mut retired = 0;
        for (key, version) in active {
            if keep.contains(&(key.as_str(), version)) {
                continue;
            }

            sqlx::query("UPDATE guideline_rules SET active = 0 WHERE key = ? AND version = ?")
                .bind(&key)
                .bind(version)
                .execute(&mut *tx)
                .await?;

            tracing::info!(key = %key, version, "Retired guideline rule");
            retired += 1;
        }

        tx.commit().await?;
        Ok(retired)
    }

    /// All active rule descriptors, ordered by key.
    pub async fn list_active_rules(&self) -> EngineResult<Vec<RuleDescriptor>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM guideline_rules WHERE active = 1 ORDER BY key, version",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

#[async_trait]
impl AuditStore for EngineRepository {
    async fn append(&self, record: &AuditRecord) -> EngineResult<()> {
        if !self.insert_audit_record(record).await? {
            tracing::debug!(
                idempotency_key = %record.idempotency_key,
                "Audit record already stored"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RuleSource for EngineRepository {
    async fn publish_rule(&self, rule: &RuleDescriptor) -> EngineResult<()> {
        EngineRepository::publish_rule(self, rule).await
    }

    async fn retire_except(&self, keep: &[RuleDescriptor]) -> EngineResult<u64> {
        self.retire_rules_except(keep).await
    }

    async fn active_rules(&self) -> EngineResult<Vec<RuleDescriptor>> {
        self.list_active_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CheckSpec, ContentKind, Decision, Fingerprint, Outcome, RequesterContext, Verdict,
    };
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> EngineRepository {
        // One connection: every new connection to :memory: is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");
        let repo = EngineRepository::new(pool);
        repo.init_schema().await.expect("Failed to init schema");
        repo
    }

    fn record(requester: &str, decision: Decision) -> AuditRecord {
        let verdict = Verdict {
            id: Uuid::new_v4(),
            decision,
            confidence: 0.8,
            risk_score: 0.25,
            findings: Vec::new(),
            registry_version: "rs-0123456789abcdef".to_string(),
            fingerprint: Fingerprint::from_hex("ab12"),
            kind: ContentKind::Text,
            created_at: chrono::Utc::now(),
        };
        AuditRecord::new(
            verdict,
            Some("excerpt".to_string()),
            false,
            RequesterContext::new(requester),
            chrono::Utc::now(),
        )
    }

    fn rule(key: &str, version: u32, term: &str) -> RuleDescriptor {
        RuleDescriptor {
            key: key.to_string(),
            version,
            kinds: vec![ContentKind::Text],
            severity_weight: 0.5,
            threshold: 0.5,
            check: CheckSpec::Keyword {
                terms: vec![term.to_string()],
                outcome: Outcome::Flag,
            },
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_audit_record() {
        let repo = setup_test_db().await;
        let rec = record("user-1", Decision::NeedsReview);

        assert!(repo.insert_audit_record(&rec).await.unwrap());

        let retrieved = repo.get_audit_record(rec.id).await.unwrap();
        assert_eq!(retrieved.id, rec.id);
        assert_eq!(retrieved.verdict.decision, Decision::NeedsReview);
        assert_eq!(retrieved.requester.requester_id, "user-1");
        assert_eq!(retrieved.excerpt.as_deref(), Some("excerpt"));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_is_ignored() {
        let repo = setup_test_db().await;
        let rec = record("user-1", Decision::Approve);

        assert!(repo.insert_audit_record(&rec).await.unwrap());
        assert!(!repo.insert_audit_record(&rec).await.unwrap());
        repo.append(&rec).await.unwrap();

        let (records, total) = repo
            .list_audit_records(&AuditFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_audit_record_not_found() {
        let repo = setup_test_db().await;
        let err = repo.get_audit_record(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_audit_records_filters() {
        let repo = setup_test_db().await;
        repo.insert_audit_record(&record("alice", Decision::Approve))
            .await
            .unwrap();
        repo.insert_audit_record(&record("alice", Decision::Reject))
            .await
            .unwrap();
        repo.insert_audit_record(&record("bob", Decision::Reject))
            .await
            .unwrap();

        let by_requester = AuditFilter {
            requester_id: Some("alice".to_string()),
            decision: None,
        };
        let (records, total) = repo.list_audit_records(&by_requester, 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert!(records.iter().all(|r| r.requester.requester_id == "alice"));

        let rejected = AuditFilter {
            requester_id: None,
            decision: Some(Decision::Reject),
        };
        let (records, total) = repo.list_audit_records(&rejected, 1, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verdict.decision, Decision::Reject);
    }

    #[tokio::test]
    async fn test_published_rule_is_immutable() {
        let repo = setup_test_db().await;

        repo.publish_rule(&rule("words", 1, "spam")).await.unwrap();
        // Identical re-publish is fine.
        repo.publish_rule(&rule("words", 1, "spam")).await.unwrap();

        let err = repo.publish_rule(&rule("words", 1, "scam")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        assert_eq!(repo.list_active_rules().await.unwrap(), vec![rule("words", 1, "spam")]);
    }

    #[tokio::test]
    async fn test_new_version_replaces_active_version() {
        let repo = setup_test_db().await;

        repo.publish_rule(&rule("words", 1, "spam")).await.unwrap();
        repo.publish_rule(&rule("words", 2, "scam")).await.unwrap();

        assert_eq!(repo.list_active_rules().await.unwrap(), vec![rule("words", 2, "scam")]);

        // Rolling back reactivates the stored version.
        repo.publish_rule(&rule("words", 1, "spam")).await.unwrap();
        assert_eq!(repo.list_active_rules().await.unwrap(), vec![rule("words", 1, "spam")]);
    }

    #[tokio::test]
    async fn test_retire_rules_except() {
        let repo = setup_test_db().await;
        let keep = rule("a", 1, "x");

        repo.publish_rule(&keep).await.unwrap();
        repo.publish_rule(&rule("b", 1, "y")).await.unwrap();

        let retired = repo.retire_rules_except(std::slice::from_ref(&keep)).await.unwrap();
        assert_eq!(retired, 1);
        assert_eq!(repo.list_active_rules().await.unwrap(), vec![keep]);
    }
}
