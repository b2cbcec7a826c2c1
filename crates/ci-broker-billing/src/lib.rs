//! Age-bucketed TTL cache fronting `GET /runs-on/{org}`, modelled on
//! `lruttl`'s `Inner<K, V>` bucketed-expiry scan but trimmed of the
//! global `CACHES` purge registry and memory-pressure subscription:
//! `kumo-server-memory` is not carried forward, since no other part of
//! this system needs a process memory-limit subsystem. Backed by
//! `dashmap` rather than `lru_cache` + `parking_lot::Mutex`, since the
//! lock-per-shard concurrent map is already part of this workspace's
//! dependency stack and a capacity of 100 entries makes the oldest-entry
//! scan on eviction cheap regardless of the map type.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// The real upstream minutes lookup is a collaborator; the core only
/// needs this seam so the cache can be unit tested without it.
#[async_trait]
pub trait BillingLookup: Send + Sync {
    async fn minutes_exhausted(&self, org: &str, visibility: &str) -> anyhow::Result<bool>;
}

/// Always reports "not exhausted". The real lookup against the billing
/// service is out of scope for this repository; see the design ledger.
pub struct StubBillingLookup;

#[async_trait]
impl BillingLookup for StubBillingLookup {
    async fn minutes_exhausted(&self, _org: &str, _visibility: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl BillingLookup for Box<dyn BillingLookup> {
    async fn minutes_exhausted(&self, org: &str, visibility: &str) -> anyhow::Result<bool> {
        (**self).minutes_exhausted(org, visibility).await
    }
}

const CAPACITY: usize = 100;
const FRESH_FOR: Duration = Duration::from_secs(60 * 60);
const EVICT_AFTER: Duration = Duration::from_secs(70 * 60);

/// The label suggested to a runner when its org's minutes have NOT been
/// exhausted, i.e. it should keep using the upstream-hosted fleet.
pub const UPSTREAM_HOSTED_LABEL: &str = "ubuntu-latest";
/// The label suggested once an org has exhausted its included minutes:
/// fall back to the self-hosted fleet.
pub const SELF_HOSTED_LABEL: &str = "firecracker";

struct CacheEntry {
    exhausted: bool,
    inserted_at: Instant,
}

/// Keyed by `(org, visibility)`. `minutes_exhausted` serves a cached
/// value while it is younger than `FRESH_FOR`; once it crosses
/// `EVICT_AFTER` the entry is forcibly dropped and the next call
/// refetches from the backing `BillingLookup`.
pub struct BillingCache<L> {
    lookup: L,
    entries: DashMap<(String, String), CacheEntry>,
}

impl<L: BillingLookup> BillingCache<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup,
            entries: DashMap::new(),
        }
    }

    pub async fn minutes_exhausted(&self, org: &str, visibility: &str) -> anyhow::Result<bool> {
        let key = (org.to_string(), visibility.to_string());

        if let Some(entry) = self.entries.get(&key) {
            let age = entry.inserted_at.elapsed();
            if age < FRESH_FOR {
                return Ok(entry.exhausted);
            }
            if age < EVICT_AFTER {
                // Stale but not yet evicted: still serve it while we
                // refresh below, so a transient lookup failure doesn't
                // immediately flip the suggested label.
                let stale = entry.exhausted;
                drop(entry);
                if let Ok(fresh) = self.lookup.minutes_exhausted(org, visibility).await {
                    self.insert(key, fresh);
                    return Ok(fresh);
                }
                return Ok(stale);
            }
            drop(entry);
            self.entries.remove(&key);
        }

        let exhausted = self.lookup.minutes_exhausted(org, visibility).await?;
        self.insert(key, exhausted);
        Ok(exhausted)
    }

    pub fn suggested_label(exhausted: bool) -> &'static str {
        if exhausted {
            SELF_HOSTED_LABEL
        } else {
            UPSTREAM_HOSTED_LABEL
        }
    }

    fn insert(&self, key: (String, String), exhausted: bool) {
        self.enforce_capacity();
        self.entries.insert(
            key,
            CacheEntry {
                exhausted,
                inserted_at: Instant::now(),
            },
        );
    }

    fn enforce_capacity(&self) {
        if self.entries.len() < CAPACITY {
            return;
        }
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone())
        {
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLookup {
        calls: Arc<AtomicUsize>,
        exhausted: bool,
    }

    #[async_trait]
    impl BillingLookup for CountingLookup {
        async fn minutes_exhausted(&self, _org: &str, _visibility: &str) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.exhausted)
        }
    }

    #[tokio::test]
    async fn caches_fresh_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = BillingCache::new(CountingLookup {
            calls: calls.clone(),
            exhausted: false,
        });

        assert!(!cache.minutes_exhausted("acme", "private").await.unwrap());
        assert!(!cache.minutes_exhausted("acme", "private").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call was served from cache");
    }

    #[tokio::test]
    async fn distinct_orgs_are_distinct_keys() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = BillingCache::new(CountingLookup {
            calls: calls.clone(),
            exhausted: true,
        });

        cache.minutes_exhausted("acme", "private").await.unwrap();
        cache.minutes_exhausted("widgets", "private").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn suggested_label_matches_exhaustion() {
        assert_eq!(BillingCache::<StubBillingLookup>::suggested_label(true), "firecracker");
        assert_eq!(
            BillingCache::<StubBillingLookup>::suggested_label(false),
            "ubuntu-latest"
        );
    }
}
