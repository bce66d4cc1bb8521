//! Decision Service - the check pipeline behind the HTTP API.
//!
//! Pipeline order:
//! 1. Validate and normalize the submission
//! 2. Resolve the current rule set
//! 3. Serve a cached verdict, or evaluate a new one
//! 4. Record the outcome for audit
//! 5. Cache a newly evaluated verdict
//!
//! Only input and registry errors reach the caller. Cache and audit
//! failures degrade to a recomputed verdict and a queued audit write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{AuditRecord, ContentItem, RequesterContext, Verdict};
use crate::engine::audit::AuditRecorder;
use crate::engine::cache::VerdictCache;
use crate::engine::evaluator::Evaluator;
use crate::engine::normalizer::ContentNormalizer;
use crate::engine::registry::RuleRegistry;
use crate::error::{EngineError, EngineResult};

/// What a check returns to the web application.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub verdict: Verdict,
    pub audit_record_id: Uuid,
    pub cache_hit: bool,
}

/// Runs checks end to end.
pub struct DecisionService {
    normalizer: ContentNormalizer,
    evaluator: Evaluator,
    registry: Arc<RuleRegistry>,
    cache: Option<Arc<dyn VerdictCache>>,
    cache_ttl: Duration,
    recorder: AuditRecorder,
}

impl DecisionService {
    pub fn new(
        normalizer: ContentNormalizer,
        evaluator: Evaluator,
        registry: Arc<RuleRegistry>,
        cache: Option<Arc<dyn VerdictCache>>,
        cache_ttl: Duration,
        recorder: AuditRecorder,
    ) -> Self {
        Self {
            normalizer,
            evaluator,
            registry,
            cache,
            cache_ttl,
            recorder,
        }
    }

    /// Check a piece of generated text.
    pub async fn check_text(
        &self,
        text: String,
        prompt: Option<String>,
        requester: RequesterContext,
    ) -> EngineResult<CheckOutcome> {
        if text.is_empty() {
            return Err(EngineError::InvalidInput("text must not be empty".to_string()));
        }
        self.check(ContentItem::text(text, prompt), requester).await
    }

    /// Check a generated image.
    pub async fn check_image(
        &self,
        bytes: Vec<u8>,
        media_type: String,
        prompt: Option<String>,
        requester: RequesterContext,
    ) -> EngineResult<CheckOutcome> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("image must not be empty".to_string()));
        }
        if media_type.trim().is_empty() {
            return Err(EngineError::InvalidInput("media_type is required".to_string()));
        }
        self.check(ContentItem::image(bytes, media_type, prompt), requester)
            .await
    }

    async fn check(
        &self,
        item: ContentItem,
        requester: RequesterContext,
    ) -> EngineResult<CheckOutcome> {
        let requested_at = Utc::now();

        if requester.requester_id.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "requester_id is required".to_string(),
            ));
        }

        let (content, fingerprint) = self.normalizer.normalize(&item)?;
        let snapshot = self.registry.current()?;
        let version = snapshot.version();

        let cached = match &self.cache {
            Some(cache) => match cache.get(&fingerprint, version).await {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        error = %e,
                        "Verdict cache lookup failed, evaluating"
                    );
                    None
                }
            },
            None => None,
        };

        let excerpt = content.excerpt();
        let cache_hit = cached.is_some();

        let verdict = match cached {
            Some(verdict) => verdict,
            None => {
                self.evaluator
                    .evaluate(Arc::new(content), &fingerprint, &snapshot)
                    .await
            }
        };

        let requester_id = requester.requester_id.clone();
        let record = AuditRecord::new(verdict.clone(), excerpt, cache_hit, requester, requested_at);
        let audit_record_id = self.recorder.record(record).await;

        // Only requests that got this far leave a cache entry behind.
        if let (false, Some(cache)) = (cache_hit, &self.cache) {
            if let Err(e) = cache
                .put(&fingerprint, version, verdict.clone(), self.cache_ttl)
                .await
            {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Failed to cache verdict"
                );
            }
        }

        tracing::info!(
            fingerprint = %fingerprint,
            kind = %verdict.kind,
            requester_id = %requester_id,
            decision = %verdict.decision,
            confidence = verdict.confidence,
            risk_score = verdict.risk_score,
            registry_version = %verdict.registry_version,
            cache_hit,
            audit_record_id = %audit_record_id,
            "Check complete"
        );

        Ok(CheckOutcome {
            verdict,
            audit_record_id,
            cache_hit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, EngineConfig};
    use crate::domain::{
        CheckSpec, ContentKind, Decision, Fingerprint, NormalizedContent, Outcome, RuleDescriptor,
    };
    use crate::engine::audit::tests::{eventually, FlakyStore};
    use crate::engine::cache::MokaVerdictCache;
    use crate::engine::checks::{CheckResult, GuidelineCheck};
    use crate::engine::registry::{CompiledRule, RegistrySnapshot};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Passing check that counts its invocations.
    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl GuidelineCheck for Counting {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult::pass(0.9, "counted"))
        }
    }

    /// Check that never finishes on its own and reports when it is dropped.
    #[derive(Default)]
    struct Stalling {
        started: AtomicBool,
        dropped: Arc<AtomicBool>,
    }

    struct MarkOnDrop(Arc<AtomicBool>);

    impl Drop for MarkOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl GuidelineCheck for Stalling {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            let _mark = MarkOnDrop(self.dropped.clone());
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CheckResult::pass(1.0, "finished"))
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl VerdictCache for BrokenCache {
        async fn get(&self, _: &Fingerprint, _: &str) -> EngineResult<Option<Verdict>> {
            Err(EngineError::CacheUnavailable("connection refused".to_string()))
        }

        async fn put(&self, _: &Fingerprint, _: &str, _: Verdict, _: Duration) -> EngineResult<()> {
            Err(EngineError::CacheUnavailable("connection refused".to_string()))
        }
    }

    fn test_rule(check: Arc<dyn GuidelineCheck>) -> CompiledRule {
        CompiledRule {
            descriptor: RuleDescriptor {
                key: "test.rule".to_string(),
                version: 1,
                kinds: vec![ContentKind::Text],
                severity_weight: 1.0,
                threshold: 0.5,
                check: CheckSpec::Keyword {
                    terms: vec!["unused".to_string()],
                    outcome: Outcome::Flag,
                },
            },
            threshold: 0.5,
            check,
        }
    }

    struct Harness {
        service: DecisionService,
        registry: Arc<RuleRegistry>,
        store: Arc<FlakyStore>,
    }

    fn harness(registry: RuleRegistry, cache: Option<Arc<dyn VerdictCache>>) -> Harness {
        harness_with(
            registry,
            cache,
            FlakyStore::default(),
            Duration::from_secs(1),
        )
    }

    fn harness_with(
        registry: RuleRegistry,
        cache: Option<Arc<dyn VerdictCache>>,
        store: FlakyStore,
        rule_timeout: Duration,
    ) -> Harness {
        crate::logging::init_test();
        let registry = Arc::new(registry);
        let store = Arc::new(store);
        let (recorder, _worker) = AuditRecorder::start(store.clone(), &AuditConfig::default());

        let service = DecisionService::new(
            ContentNormalizer::new(&EngineConfig::default()),
            Evaluator::new(rule_timeout),
            registry.clone(),
            cache,
            Duration::from_secs(60),
            recorder,
        );

        Harness {
            service,
            registry,
            store,
        }
    }

    fn moka() -> Option<Arc<dyn VerdictCache>> {
        Some(Arc::new(MokaVerdictCache::new(100)))
    }

    #[tokio::test]
    async fn test_clean_text_with_no_rules_approves() {
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts("rs-empty", Vec::new())),
            moka(),
        );

        let outcome = h
            .service
            .check_text("This is fine.".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();

        assert_eq!(outcome.verdict.decision, Decision::Approve);
        assert!(outcome.verdict.findings.is_empty());
        assert!(!outcome.cache_hit);

        let stored = h.store.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, outcome.audit_record_id);
        assert_eq!(stored[0].excerpt.as_deref(), Some("This is fine."));
    }

    #[tokio::test]
    async fn test_repeat_submission_is_served_from_cache() {
        let counter = Arc::new(Counting::default());
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts(
                "rs-1",
                vec![test_rule(counter.clone())],
            )),
            moka(),
        );

        let first = h
            .service
            .check_text("Hello   world".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();
        let second = h
            .service
            .check_text("Hello world".to_string(), None, RequesterContext::new("u2"))
            .await
            .unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(first.verdict, second.verdict);
        assert_ne!(first.audit_record_id, second.audit_record_id);

        let stored = h.store.stored();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.iter().filter(|r| r.cache_hit).count(), 1);
    }

    #[tokio::test]
    async fn test_new_rule_set_version_misses_cache() {
        let counter = Arc::new(Counting::default());
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts(
                "rs-1",
                vec![test_rule(counter.clone())],
            )),
            moka(),
        );

        h.service
            .check_text("Same text".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();

        h.registry.publish(RegistrySnapshot::from_parts(
            "rs-2",
            vec![test_rule(counter.clone())],
        ));

        let outcome = h
            .service
            .check_text("Same text".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(outcome.verdict.registry_version, "rs-2");
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_failure_still_returns_verdict() {
        let counter = Arc::new(Counting::default());
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts(
                "rs-1",
                vec![test_rule(counter.clone())],
            )),
            Some(Arc::new(BrokenCache)),
        );

        for _ in 0..2 {
            let outcome = h
                .service
                .check_text("Cache down".to_string(), None, RequesterContext::new("u1"))
                .await
                .unwrap();
            assert!(!outcome.cache_hit);
            assert_eq!(outcome.verdict.decision, Decision::Approve);
        }

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_media_type_is_rejected_without_audit() {
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts("rs-1", Vec::new())),
            moka(),
        );

        let err = h
            .service
            .check_image(
                vec![1, 2, 3],
                "application/x-foo".to_string(),
                None,
                RequesterContext::new("u1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UnsupportedMediaType(_)));
        assert!(h.store.stored().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let h = harness(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts("rs-1", Vec::new())),
            moka(),
        );

        let empty_text = h
            .service
            .check_text(String::new(), None, RequesterContext::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(empty_text, EngineError::InvalidInput(_)));

        let no_requester = h
            .service
            .check_text("hi".to_string(), None, RequesterContext::new(" "))
            .await
            .unwrap_err();
        assert!(matches!(no_requester, EngineError::InvalidInput(_)));

        let no_media_type = h
            .service
            .check_image(vec![1], String::new(), None, RequesterContext::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(no_media_type, EngineError::InvalidInput(_)));

        assert!(h.store.stored().is_empty());
    }

    #[tokio::test]
    async fn test_unloaded_registry_is_unavailable() {
        let h = harness(RuleRegistry::new(), moka());

        let err = h
            .service
            .check_text("hi".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dropped_check_aborts_rules_and_writes_nothing() {
        let stalling = Arc::new(Stalling::default());
        let cache = Arc::new(MokaVerdictCache::new(100));
        let h = harness_with(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts(
                "rs-1",
                vec![test_rule(stalling.clone())],
            )),
            Some(cache.clone() as Arc<dyn VerdictCache>),
            FlakyStore::default(),
            Duration::from_secs(30),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            h.service
                .check_text("Slow text".to_string(), None, RequesterContext::new("u1")),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(stalling.started.load(Ordering::SeqCst));

        // Well inside the rule timeout, so only an abort can drop the check.
        assert!(eventually(|| stalling.dropped.load(Ordering::SeqCst)).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.attempts.load(Ordering::SeqCst), 0);
        assert!(h.store.stored().is_empty());

        let (_, fingerprint) = ContentNormalizer::new(&EngineConfig::default())
            .normalize(&ContentItem::text("Slow text", None))
            .unwrap();
        assert!(cache.get(&fingerprint, "rs-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_audit_write_still_returns_verdict() {
        let h = harness_with(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts("rs-1", Vec::new())),
            moka(),
            FlakyStore::failing(1),
            Duration::from_secs(1),
        );

        let outcome = h
            .service
            .check_text("Store hiccup".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();
        assert_eq!(outcome.verdict.decision, Decision::Approve);

        assert!(eventually(|| h.store.stored().len() == 1).await);
        assert_eq!(h.store.stored()[0].id, outcome.audit_record_id);
        assert_eq!(h.store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_audit_write_is_retried_without_duplicates() {
        // Commits, then answers after the inline deadline has passed.
        let h = harness_with(
            RuleRegistry::with_snapshot(RegistrySnapshot::from_parts("rs-1", Vec::new())),
            moka(),
            FlakyStore::slow(1, Duration::from_secs(2)),
            Duration::from_secs(1),
        );

        let outcome = h
            .service
            .check_text("Slow store".to_string(), None, RequesterContext::new("u1"))
            .await
            .unwrap();
        assert_eq!(outcome.verdict.decision, Decision::Approve);

        assert!(eventually(|| h.store.attempts.load(Ordering::SeqCst) == 2).await);
        let stored = h.store.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, outcome.audit_record_id);
    }
}
