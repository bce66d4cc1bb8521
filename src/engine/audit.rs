//! Audit Recorder - append-only evaluation records with retried delivery.
//!
//! The first write is attempted inline with a short deadline. If it fails,
//! the record is handed to a background worker that retries with
//! exponential backoff. Writes are idempotent on the record's
//! idempotency key, so retries never duplicate a record. Records that
//! cannot be delivered are counted and logged as `audit_write_dropped`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::domain::AuditRecord;
use crate::error::{EngineError, EngineResult};

/// Durable, append-only store for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record. A second append with the same idempotency key is a
    /// no-op.
    async fn append(&self, record: &AuditRecord) -> EngineResult<()>;
}

/// Backoff schedule for redelivering audit records.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per record, including the inline one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&AuditConfig> for RetryPolicy {
    fn from(config: &AuditConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_base_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }
}

/// Records evaluations without ever failing the request that produced them.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    queue: mpsc::Sender<AuditRecord>,
    write_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl AuditRecorder {
    /// Create a recorder and spawn its retry worker.
    pub fn start(store: Arc<dyn AuditStore>, config: &AuditConfig) -> (Self, JoinHandle<()>) {
        let (queue, pending) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(retry_worker(
            store.clone(),
            pending,
            RetryPolicy::from(config),
            dropped.clone(),
        ));

        let recorder = Self {
            store,
            queue,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            dropped,
        };

        (recorder, worker)
    }

    /// Record an evaluation and return its id.
    ///
    /// Returns as soon as the record is either stored or queued for retry.
    pub async fn record(&self, record: AuditRecord) -> Uuid {
        let id = record.id;

        let failure = match tokio::time::timeout(self.write_timeout, self.store.append(&record)).await
        {
            Ok(Ok(())) => {
                tracing::debug!(audit_record_id = %id, "Audit record stored");
                return id;
            }
            Ok(Err(e)) => EngineError::AuditWriteFailed(e.to_string()),
            Err(_) => EngineError::AuditWriteFailed(format!(
                "store did not answer within {:?}",
                self.write_timeout
            )),
        };

        tracing::warn!(
            audit_record_id = %id,
            error = %failure,
            "Audit write failed, queueing for retry"
        );

        match self.queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                report_dropped(&self.dropped, &record, "retry queue is full")
            }
            Err(TrySendError::Closed(record)) => {
                report_dropped(&self.dropped, &record, "retry worker has stopped")
            }
        }

        id
    }

    /// Records that could not be delivered since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn report_dropped(dropped: &AtomicU64, record: &AuditRecord, cause: &str) {
    dropped.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        event = "audit_write_dropped",
        audit_record_id = %record.id,
        idempotency_key = %record.idempotency_key,
        fingerprint = %record.fingerprint,
        cause,
        "Audit record could not be delivered"
    );
}

async fn retry_worker(
    store: Arc<dyn AuditStore>,
    mut pending: mpsc::Receiver<AuditRecord>,
    policy: RetryPolicy,
    dropped: Arc<AtomicU64>,
) {
    while let Some(record) = pending.recv().await {
        // The inline write was attempt 1.
        let mut attempt = 1;

        loop {
            if attempt >= policy.max_attempts {
                report_dropped(&dropped, &record, "retry attempts exhausted");
                break;
            }

            tokio::time::sleep(policy.backoff(attempt)).await;
            attempt += 1;

            match store.append(&record).await {
                Ok(()) => {
                    tracing::info!(
                        audit_record_id = %record.id,
                        attempt,
                        "Audit record delivered on retry"
                    );
                    break;
                }
                Err(e) => tracing::warn!(
                    audit_record_id = %record.id,
                    attempt,
                    error = %e,
                    "Audit retry failed"
                ),
            }
        }
    }

    tracing::debug!("Audit retry worker stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{ContentKind, Decision, Fingerprint, RequesterContext, Verdict};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Store that fails a number of appends before succeeding.
    ///
    /// A slow store commits each of its first appends but answers only after
    /// `ack_delay`.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub(crate) failures_left: Mutex<u32>,
        pub(crate) slow_acks_left: Mutex<u32>,
        pub(crate) ack_delay: Duration,
        pub(crate) attempts: AtomicU64,
        pub(crate) records: Mutex<HashMap<Uuid, AuditRecord>>,
    }

    impl FlakyStore {
        pub(crate) fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                ..Default::default()
            }
        }

        pub(crate) fn slow(times: u32, ack_delay: Duration) -> Self {
            Self {
                slow_acks_left: Mutex::new(times),
                ack_delay,
                ..Default::default()
            }
        }

        pub(crate) fn stored(&self) -> Vec<AuditRecord> {
            self.records.lock().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append(&self, record: &AuditRecord) -> EngineResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(EngineError::Internal("store offline".to_string()));
                }
            }
            self.records
                .lock()
                .unwrap()
                .entry(record.idempotency_key)
                .or_insert_with(|| record.clone());

            let slow = {
                let mut left = self.slow_acks_left.lock().unwrap();
                let slow = *left > 0;
                if slow {
                    *left -= 1;
                }
                slow
            };
            if slow {
                tokio::time::sleep(self.ack_delay).await;
            }
            Ok(())
        }
    }

    fn config(max_attempts: u32) -> AuditConfig {
        AuditConfig {
            write_timeout_ms: 100,
            queue_capacity: 8,
            retry_max_attempts: max_attempts,
            retry_base_backoff_ms: 5,
            retry_max_backoff_ms: 20,
        }
    }

    fn record() -> AuditRecord {
        let verdict = Verdict {
            id: Uuid::new_v4(),
            decision: Decision::Approve,
            confidence: 1.0,
            risk_score: 0.0,
            findings: Vec::new(),
            registry_version: "rs-test".to_string(),
            fingerprint: Fingerprint::from_hex("aa"),
            kind: ContentKind::Text,
            created_at: chrono::Utc::now(),
        };
        AuditRecord::new(
            verdict,
            None,
            false,
            RequesterContext::new("user-1"),
            chrono::Utc::now(),
        )
    }

    pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_healthy_store_writes_inline() {
        let store = Arc::new(FlakyStore::default());
        let (recorder, _worker) = AuditRecorder::start(store.clone(), &config(3));

        let rec = record();
        let id = recorder.record(rec.clone()).await;

        assert_eq!(id, rec.id);
        assert_eq!(store.stored(), vec![rec]);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_exactly_once_stored() {
        let store = Arc::new(FlakyStore::failing(2));
        let (recorder, _worker) = AuditRecorder::start(store.clone(), &config(5));

        let id = recorder.record(record()).await;
        assert!(store.stored().is_empty());

        assert!(eventually(|| store.stored().len() == 1).await);
        assert_eq!(store.stored()[0].id, id);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.dropped(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_write_that_committed_is_not_duplicated() {
        let store = Arc::new(FlakyStore::slow(1, Duration::from_secs(1)));
        let (recorder, _worker) = AuditRecorder::start(store.clone(), &config(3));

        let rec = record();
        let id = recorder.record(rec.clone()).await;
        assert_eq!(id, rec.id);

        assert!(eventually(|| store.attempts.load(Ordering::SeqCst) == 2).await);
        assert_eq!(store.stored(), vec![rec]);
        assert_eq!(recorder.dropped(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_counted() {
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        let (recorder, _worker) = AuditRecorder::start(store.clone(), &config(3));

        recorder.record(record()).await;

        assert!(eventually(|| recorder.dropped() == 1).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.stored().is_empty());
    }
}
