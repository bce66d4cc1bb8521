//! Evaluator - runs applicable rules and aggregates their findings.
//!
//! Rules run concurrently as independent tasks. A rule that errors, panics
//! or times out yields an `error` finding; the evaluation itself always
//! completes. Dropping the evaluation future aborts rules still running.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::domain::{Decision, Finding, Fingerprint, NormalizedContent, Outcome, Verdict};
use crate::engine::registry::{CompiledRule, RegistrySnapshot};

/// Confidence an `error` finding contributes to a review decision.
const ERROR_REVIEW_CONFIDENCE: f64 = 0.5;

/// Aggregated decision before it is wrapped in a verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub decision: Decision,
    pub confidence: f64,
    pub risk_score: f64,
}

/// Runs a snapshot's rules against normalized content.
#[derive(Debug, Clone)]
pub struct Evaluator {
    rule_timeout: Duration,
}

impl Evaluator {
    pub fn new(rule_timeout: Duration) -> Self {
        Self { rule_timeout }
    }

    /// Evaluate content against every applicable rule in the snapshot.
    pub async fn evaluate(
        &self,
        content: Arc<NormalizedContent>,
        fingerprint: &Fingerprint,
        snapshot: &RegistrySnapshot,
    ) -> Verdict {
        let rules: Vec<CompiledRule> = snapshot.applicable(content.kind).cloned().collect();
        let findings = self.run_rules(&rules, content.clone()).await;
        let aggregate = aggregate(&rules, &findings);

        tracing::debug!(
            fingerprint = %fingerprint,
            registry_version = %snapshot.version(),
            rules = rules.len(),
            decision = %aggregate.decision,
            "Evaluation aggregated"
        );

        Verdict {
            id: uuid::Uuid::new_v4(),
            decision: aggregate.decision,
            confidence: aggregate.confidence,
            risk_score: aggregate.risk_score,
            findings,
            registry_version: snapshot.version().to_string(),
            fingerprint: fingerprint.clone(),
            kind: content.kind,
            created_at: chrono::Utc::now(),
        }
    }

    /// Run rules concurrently; findings come back in rule order.
    async fn run_rules(
        &self,
        rules: &[CompiledRule],
        content: Arc<NormalizedContent>,
    ) -> Vec<Finding> {
        let mut tasks = JoinSet::new();

        for (index, rule) in rules.iter().enumerate() {
            let check = rule.check.clone();
            let content = content.clone();
            let timeout = self.rule_timeout;
            tasks.spawn(async move {
                let result = tokio::time::timeout(timeout, check.evaluate(&content)).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<Finding>> = vec![None; rules.len()];

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The slot stays empty and is filled below.
                    tracing::error!(error = %e, panicked = e.is_panic(), "Rule task terminated");
                    continue;
                }
            };

            let rule = &rules[index];
            let finding = match result {
                Ok(Ok(check)) => Finding::new(
                    rule.key(),
                    rule.version(),
                    check.outcome,
                    check.confidence,
                    check.reason,
                ),
                Ok(Err(e)) => {
                    tracing::warn!(rule = rule.key(), error = %e, "Rule execution failed");
                    Finding::error(rule.key(), rule.version(), e.to_string())
                }
                Err(_) => {
                    tracing::warn!(
                        rule = rule.key(),
                        timeout_ms = self.rule_timeout.as_millis() as u64,
                        "Rule timed out"
                    );
                    Finding::error(
                        rule.key(),
                        rule.version(),
                        format!("Rule timed out after {:?}", self.rule_timeout),
                    )
                }
            };
            slots[index] = Some(finding);
        }

        slots
            .into_iter()
            .zip(rules)
            .map(|(slot, rule)| {
                slot.unwrap_or_else(|| {
                    Finding::error(rule.key(), rule.version(), "Rule terminated unexpectedly")
                })
            })
            .collect()
    }
}

/// Combine findings into a decision, confidence and risk score.
///
/// `reject` when any `fail` is above its rule's threshold; `needs_review`
/// when any `flag`, `error` or below-threshold `fail` exists; else
/// `approve`.
pub fn aggregate(rules: &[CompiledRule], findings: &[Finding]) -> Aggregate {
    let mut reject_confidence: Option<f64> = None;
    let mut review_confidence: Option<f64> = None;
    let mut pass_confidences = Vec::new();
    let mut weighted_risk = 0.0;
    let mut total_weight = 0.0;

    for (rule, finding) in rules.iter().zip(findings) {
        let weight = rule.descriptor.severity_weight;
        total_weight += weight;

        match finding.outcome {
            Outcome::Fail if finding.confidence > rule.threshold => {
                reject_confidence = Some(reject_confidence.map_or(finding.confidence, |c| {
                    c.max(finding.confidence)
                }));
                weighted_risk += weight * finding.confidence;
            }
            Outcome::Fail | Outcome::Flag => {
                review_confidence = Some(review_confidence.map_or(finding.confidence, |c| {
                    c.max(finding.confidence)
                }));
                weighted_risk += weight * finding.confidence;
            }
            Outcome::Error => {
                review_confidence = Some(
                    review_confidence.map_or(ERROR_REVIEW_CONFIDENCE, |c| {
                        c.max(ERROR_REVIEW_CONFIDENCE)
                    }),
                );
            }
            Outcome::Pass => pass_confidences.push(finding.confidence),
        }
    }

    let risk_score = if total_weight > 0.0 {
        round4((weighted_risk / total_weight).clamp(0.0, 1.0))
    } else {
        0.0
    };

    let (decision, confidence) = match (reject_confidence, review_confidence) {
        (Some(c), _) => (Decision::Reject, c),
        (None, Some(c)) => (Decision::NeedsReview, c),
        (None, None) if pass_confidences.is_empty() => (Decision::Approve, 1.0),
        (None, None) => (
            Decision::Approve,
            pass_confidences.iter().sum::<f64>() / pass_confidences.len() as f64,
        ),
    };

    Aggregate {
        decision,
        confidence: round4(confidence),
        risk_score,
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CheckSpec, ContentKind, NormalizedBody, RuleDescriptor};
    use crate::engine::checks::{CheckResult, GuidelineCheck};
    use crate::error::{EngineError, EngineResult};
    use async_trait::async_trait;

    /// Check returning a fixed result.
    struct Fixed(Outcome, f64);

    #[async_trait]
    impl GuidelineCheck for Fixed {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            Ok(CheckResult::new(self.0, self.1, "fixed"))
        }
    }

    struct Failing;

    #[async_trait]
    impl GuidelineCheck for Failing {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            Err(EngineError::RuleExecution("classifier offline".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl GuidelineCheck for Panicking {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            panic!("rule bug");
        }
    }

    struct Slow;

    #[async_trait]
    impl GuidelineCheck for Slow {
        async fn evaluate(&self, _content: &NormalizedContent) -> EngineResult<CheckResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CheckResult::pass(1.0, "late"))
        }
    }

    fn rule(key: &str, threshold: f64, check: Arc<dyn GuidelineCheck>) -> CompiledRule {
        CompiledRule {
            descriptor: RuleDescriptor {
                key: key.to_string(),
                version: 1,
                kinds: vec![ContentKind::Text],
                severity_weight: 1.0,
                threshold,
                check: CheckSpec::Keyword {
                    terms: vec!["unused".to_string()],
                    outcome: Outcome::Flag,
                },
            },
            threshold,
            check,
        }
    }

    fn content() -> Arc<NormalizedContent> {
        Arc::new(NormalizedContent {
            kind: ContentKind::Text,
            body: NormalizedBody::Text("This is fine.".to_string()),
            prompt: None,
        })
    }

    async fn run(rules: Vec<CompiledRule>) -> Verdict {
        crate::logging::init_test();
        let snapshot = RegistrySnapshot::from_parts("rs-test", rules);
        Evaluator::new(Duration::from_millis(200))
            .evaluate(content(), &Fingerprint::from_hex("00"), &snapshot)
            .await
    }

    #[tokio::test]
    async fn test_no_rules_approves_with_empty_findings() {
        let verdict = run(Vec::new()).await;
        assert_eq!(verdict.decision, Decision::Approve);
        assert!(verdict.findings.is_empty());
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.risk_score, 0.0);
        assert_eq!(verdict.registry_version, "rs-test");
    }

    #[tokio::test]
    async fn test_fail_above_threshold_rejects_regardless_of_others() {
        let verdict = run(vec![
            rule("a", 0.5, Arc::new(Fixed(Outcome::Pass, 1.0))),
            rule("b", 0.5, Arc::new(Fixed(Outcome::Flag, 0.9))),
            rule("c", 0.5, Arc::new(Failing)),
            rule("d", 0.5, Arc::new(Fixed(Outcome::Fail, 0.8))),
        ])
        .await;

        assert_eq!(verdict.decision, Decision::Reject);
        assert_eq!(verdict.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_fail_at_or_below_threshold_needs_review() {
        let verdict = run(vec![rule("a", 0.8, Arc::new(Fixed(Outcome::Fail, 0.8)))]).await;
        assert_eq!(verdict.decision, Decision::NeedsReview);
    }

    #[tokio::test]
    async fn test_flag_needs_review() {
        let verdict = run(vec![
            rule("a", 0.5, Arc::new(Fixed(Outcome::Pass, 1.0))),
            rule("b", 0.5, Arc::new(Fixed(Outcome::Flag, 0.6))),
        ])
        .await;
        assert_eq!(verdict.decision, Decision::NeedsReview);
        assert_eq!(verdict.confidence, 0.6);
        assert_eq!(verdict.risk_score, 0.3);
    }

    #[tokio::test]
    async fn test_erroring_rule_is_recorded_and_needs_review() {
        let verdict = run(vec![
            rule("ok", 0.5, Arc::new(Fixed(Outcome::Pass, 0.9))),
            rule("broken", 0.5, Arc::new(Failing)),
        ])
        .await;

        assert_eq!(verdict.decision, Decision::NeedsReview);
        assert_eq!(verdict.findings.len(), 2);
        assert_eq!(verdict.findings[0].outcome, Outcome::Pass);
        assert_eq!(verdict.findings[1].outcome, Outcome::Error);
        assert!(verdict.findings[1].reason.contains("classifier offline"));
    }

    #[tokio::test]
    async fn test_panicking_rule_does_not_abort_evaluation() {
        let verdict = run(vec![
            rule("panics", 0.5, Arc::new(Panicking)),
            rule("ok", 0.5, Arc::new(Fixed(Outcome::Pass, 1.0))),
        ])
        .await;

        assert_eq!(verdict.decision, Decision::NeedsReview);
        assert_eq!(verdict.findings[0].rule_key, "panics");
        assert_eq!(verdict.findings[0].outcome, Outcome::Error);
        assert_eq!(verdict.findings[1].outcome, Outcome::Pass);
    }

    #[tokio::test]
    async fn test_slow_rule_times_out_into_error() {
        let verdict = run(vec![rule("slow", 0.5, Arc::new(Slow))]).await;
        assert_eq!(verdict.findings[0].outcome, Outcome::Error);
        assert!(verdict.findings[0].reason.contains("timed out"));
        assert_eq!(verdict.decision, Decision::NeedsReview);
    }

    #[tokio::test]
    async fn test_all_pass_approves_with_mean_confidence() {
        let verdict = run(vec![
            rule("a", 0.5, Arc::new(Fixed(Outcome::Pass, 1.0))),
            rule("b", 0.5, Arc::new(Fixed(Outcome::Pass, 0.8))),
        ])
        .await;
        assert_eq!(verdict.decision, Decision::Approve);
        assert_eq!(verdict.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_rules_for_other_kind_are_skipped() {
        let mut image_rule = rule("image-only", 0.5, Arc::new(Fixed(Outcome::Fail, 1.0)));
        image_rule.descriptor.kinds = vec![ContentKind::Image];

        let verdict = run(vec![image_rule]).await;
        assert_eq!(verdict.decision, Decision::Approve);
        assert!(verdict.findings.is_empty());
    }
}
