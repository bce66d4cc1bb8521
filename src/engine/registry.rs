//! Rule Registry - immutable, versioned rule-set snapshots.
//!
//! A snapshot is built once and never mutated. Publishing a new rule set
//! swaps the pointer; in-flight evaluations keep the snapshot they started
//! with alive through their own `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::domain::{ContentKind, RuleDescriptor};
use crate::engine::checks::{CheckFactory, GuidelineCheck};
use crate::error::{EngineError, EngineResult};

/// A rule ready to run: its descriptor, effective threshold and check.
#[derive(Clone)]
pub struct CompiledRule {
    pub descriptor: RuleDescriptor,
    /// Descriptor threshold, or the configured override for this key.
    pub threshold: f64,
    pub check: Arc<dyn GuidelineCheck>,
}

impl CompiledRule {
    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    pub fn version(&self) -> u32 {
        self.descriptor.version
    }
}

impl std::fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRule")
            .field("key", &self.descriptor.key)
            .field("version", &self.descriptor.version)
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Immutable, versioned set of active guideline rules.
#[derive(Debug)]
pub struct RegistrySnapshot {
    version: String,
    rules: Vec<CompiledRule>,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Compile descriptors into a snapshot.
    ///
    /// Rules are ordered by `(key, version)`; the snapshot version is a
    /// digest of the ordered descriptors and the threshold overrides that
    /// touch them, so identical rule sets always share a version.
    pub fn compile(
        mut descriptors: Vec<RuleDescriptor>,
        factory: &CheckFactory,
        thresholds: &HashMap<String, f64>,
    ) -> EngineResult<Self> {
        descriptors.sort_by(|a, b| (&a.key, a.version).cmp(&(&b.key, b.version)));
        for descriptor in &descriptors {
            descriptor.validate()?;
        }

        let overrides: BTreeMap<String, f64> = descriptors
            .iter()
            .filter_map(|d| thresholds.get(&d.key).map(|t| (d.key.clone(), *t)))
            .collect();
        if let Some((key, t)) = overrides.iter().find(|(_, t)| !(0.0..=1.0).contains(*t)) {
            return Err(EngineError::Config(format!(
                "threshold override for {} must be within [0, 1], got {}",
                key, t
            )));
        }

        let canonical = serde_json::to_vec(&(&descriptors, &overrides))?;
        let digest = hex::encode(Sha256::digest(&canonical));
        let version = format!("rs-{}", &digest[..16]);

        let rules = descriptors
            .into_iter()
            .map(|descriptor| CompiledRule {
                threshold: overrides
                    .get(descriptor.key.as_str())
                    .copied()
                    .unwrap_or(descriptor.threshold),
                check: factory.build(&descriptor.check),
                descriptor,
            })
            .collect();

        Ok(Self::from_parts(version, rules))
    }

    /// Assemble a snapshot from already compiled rules.
    pub fn from_parts(version: impl Into<String>, rules: Vec<CompiledRule>) -> Self {
        Self {
            version: version.into(),
            rules,
            loaded_at: Utc::now(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Rules that apply to the given content kind, in registry order.
    pub fn applicable(&self, kind: ContentKind) -> impl Iterator<Item = &CompiledRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.descriptor.applies_to(kind))
    }
}

/// Holder of the current snapshot.
#[derive(Default)]
pub struct RuleRegistry {
    current: ArcSwapOption<RegistrySnapshot>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        registry.publish(snapshot);
        registry
    }

    /// The snapshot new evaluations should use.
    pub fn current(&self) -> EngineResult<Arc<RegistrySnapshot>> {
        self.current.load_full().ok_or_else(|| {
            EngineError::RegistryUnavailable("no rule set has been loaded".to_string())
        })
    }

    /// Version of the current snapshot, if any.
    pub fn version(&self) -> Option<String> {
        self.current
            .load_full()
            .map(|snapshot| snapshot.version().to_string())
    }

    /// Swap in a snapshot. Returns `true` if the version changed.
    pub fn publish(&self, snapshot: RegistrySnapshot) -> bool {
        let previous = self.version();
        let changed = previous.as_deref() != Some(snapshot.version());

        if changed {
            tracing::info!(
                previous = ?previous,
                version = %snapshot.version(),
                rules = snapshot.rules().len(),
                "Publishing rule set"
            );
            self.current.store(Some(Arc::new(snapshot)));
        }

        changed
    }
}

/// Durable source of rule descriptors.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Publish a descriptor and make it the active version of its key.
    /// Re-publishing an identical `(key, version)` only reactivates it; a
    /// different body under an existing pair is rejected.
    async fn publish_rule(&self, rule: &RuleDescriptor) -> EngineResult<()>;

    /// Deactivate every rule not listed in `keep`. Returns how many were
    /// retired.
    async fn retire_except(&self, keep: &[RuleDescriptor]) -> EngineResult<u64>;

    /// All descriptors currently marked active.
    async fn active_rules(&self) -> EngineResult<Vec<RuleDescriptor>>;
}

/// Loads snapshots from a [`RuleSource`] into a [`RuleRegistry`].
#[derive(Clone)]
pub struct RegistryLoader {
    source: Arc<dyn RuleSource>,
    factory: CheckFactory,
    thresholds: HashMap<String, f64>,
}

impl RegistryLoader {
    pub fn new(
        source: Arc<dyn RuleSource>,
        factory: CheckFactory,
        thresholds: HashMap<String, f64>,
    ) -> Self {
        Self {
            source,
            factory,
            thresholds,
        }
    }

    /// Publish seed descriptors into the source. The seed becomes the
    /// whole active set.
    pub async fn seed(&self, rules: &[RuleDescriptor]) -> EngineResult<()> {
        for rule in rules {
            rule.validate()?;
        }
        for rule in rules {
            self.source.publish_rule(rule).await?;
        }
        let retired = self.source.retire_except(rules).await?;

        tracing::info!(count = rules.len(), retired, "Seeded guideline rules");
        Ok(())
    }

    /// Load the active rules and publish them if the version changed.
    pub async fn reload(&self, registry: &RuleRegistry) -> EngineResult<bool> {
        let descriptors = self.source.active_rules().await?;
        let snapshot = RegistrySnapshot::compile(descriptors, &self.factory, &self.thresholds)?;
        Ok(registry.publish(snapshot))
    }

    /// Reload on a fixed cadence. Failures keep the previous snapshot.
    pub fn spawn_refresh(self, registry: Arc<RuleRegistry>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; startup already loaded.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.reload(&registry).await {
                    Ok(true) => tracing::info!("Rule set refreshed"),
                    Ok(false) => tracing::debug!("Rule set unchanged"),
                    Err(e) => tracing::warn!(
                        error = %e,
                        version = ?registry.version(),
                        "Rule set refresh failed, keeping current snapshot"
                    ),
                }
            }
        })
    }
}
