//! Verdict Cache - verdicts keyed by fingerprint and rule-set version.
//!
//! The cache is advisory. Callers treat `CacheUnavailable` as a miss and
//! recompute; a verdict from one rule-set version is never served for
//! another.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

use crate::domain::{Fingerprint, Verdict};
use crate::error::EngineResult;

/// Storage for previously computed verdicts.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    /// Look up a live verdict for this content under this rule-set version.
    async fn get(
        &self,
        fingerprint: &Fingerprint,
        registry_version: &str,
    ) -> EngineResult<Option<Verdict>>;

    /// Store a verdict for `ttl`.
    async fn put(
        &self,
        fingerprint: &Fingerprint,
        registry_version: &str,
        verdict: Verdict,
        ttl: Duration,
    ) -> EngineResult<()>;
}

type CacheKey = (Fingerprint, String);

#[derive(Clone)]
struct CachedVerdict {
    verdict: Arc<Verdict>,
    ttl: Duration,
    expires_at: Instant,
}

/// Expires each entry after its own TTL.
struct PerEntryTtl;

impl Expiry<CacheKey, CachedVerdict> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedVerdict,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process verdict cache with bounded capacity.
pub struct MokaVerdictCache {
    cache: Cache<CacheKey, CachedVerdict>,
}

impl MokaVerdictCache {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }
}

impl Default for MokaVerdictCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl VerdictCache for MokaVerdictCache {
    async fn get(
        &self,
        fingerprint: &Fingerprint,
        registry_version: &str,
    ) -> EngineResult<Option<Verdict>> {
        let key = (fingerprint.clone(), registry_version.to_string());

        let Some(entry) = self.cache.get(&key).await else {
            return Ok(None);
        };

        if Instant::now() >= entry.expires_at {
            self.cache.invalidate(&key).await;
            return Ok(None);
        }

        Ok(Some(entry.verdict.as_ref().clone()))
    }

    async fn put(
        &self,
        fingerprint: &Fingerprint,
        registry_version: &str,
        verdict: Verdict,
        ttl: Duration,
    ) -> EngineResult<()> {
        let entry = CachedVerdict {
            verdict: Arc::new(verdict),
            ttl,
            expires_at: Instant::now() + ttl,
        };

        self.cache
            .insert((fingerprint.clone(), registry_version.to_string()), entry)
            .await;

        Ok(())
    }
}
