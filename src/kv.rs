//! The key/value store capability the core depends on (spec §6, "KV store").
//!
//! The replay set, rate-limit counters, the prepaid ledger, rollback points,
//! job records and the priority queue all live behind this trait. Call sites
//! depend only on the primitives being linearizable per key, exactly as
//! spec §6 requires; [`InMemoryKvStore`] provides that by construction (a
//! single `dashmap::DashMap` shard lock per key) and is the reference
//! implementation this crate ships and tests against, the same way the
//! teacher facilitator ships `ProviderCache` as a concrete reference next to
//! its abstract provider traits.
//!
//! `lpush`/`rpop` form a FIFO pair: `lpush` inserts at the list head, `rpop`
//! removes from the tail, so the item resident longest is always the one
//! `rpop` returns. The priority queue (`crate::queue`) uses this pair for
//! both fresh admission and backoff re-entry, which is what makes "push to
//! the tail" and "push via lpush" the same operation here.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Capability set for the durable store the admission gate, queue, and
/// lifecycle manager depend on. Mirrors spec §6's `get`, `set`,
/// `set_if_absent`, `incr`, `del`, `lpush`, `rpop`, `llen`.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    /// Reads a key's raw value, if present and unexpired.
    async fn get(&self, key: &str) -> Option<String>;

    /// Unconditionally sets a key with an optional TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Sets a key only if absent (or expired), atomically. Returns `true` if
    /// the set took effect. This is the primitive the replay guard (spec
    /// §4.1 step 3) depends on being atomic-on-insert.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> bool;

    /// Atomically increments a counter key by `by`, creating it at `by` if
    /// absent, and returns the resulting value. Used by the rate limiter.
    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> i64;

    /// Deletes a key. No-op if absent.
    async fn del(&self, key: &str);

    /// Pushes a value onto a list.
    async fn lpush(&self, list: &str, value: String);

    /// Pops the longest-resident value from a list, if any.
    async fn rpop(&self, list: &str) -> Option<String>;

    /// Returns the length of a list.
    async fn llen(&self, list: &str) -> u64;

    /// Returns every live scalar key starting with `prefix`. Used by the
    /// startup reconciliation sweep (spec §9) to find `rollback:{job_id}`
    /// records; not on any admission/lifecycle hot path.
    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// In-process reference [`KvStore`] backed by `dashmap`. Suitable for tests
/// and single-process deployments; a production deployment would back this
/// trait with Redis or an equivalent linearizable-per-key store instead.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    scalars: DashMap<String, Entry>,
    lists: DashMap<String, Vec<String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_entry(value: String, ttl: Option<Duration>) -> Entry {
        Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        let entry = self.scalars.get(key)?;
        if entry.is_live() {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.scalars.remove(key);
            None
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.scalars
            .insert(key.to_string(), Self::make_entry(value, ttl));
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.scalars.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    false
                } else {
                    occupied.insert(Self::make_entry(value, ttl));
                    true
                }
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(Self::make_entry(value, ttl));
                true
            }
        }
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> i64 {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.scalars.entry(key.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                let current = if occupied.get().is_live() {
                    occupied.get().value.parse::<i64>().unwrap_or(0)
                } else {
                    0
                };
                let next = current + by;
                occupied.insert(Self::make_entry(next.to_string(), ttl));
                next
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(Self::make_entry(by.to_string(), ttl));
                by
            }
        }
    }

    async fn del(&self, key: &str) {
        self.scalars.remove(key);
    }

    async fn lpush(&self, list: &str, value: String) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .insert(0, value);
    }

    async fn rpop(&self, list: &str) -> Option<String> {
        let mut entry = self.lists.get_mut(list)?;
        entry.pop()
    }

    async fn llen(&self, list: &str) -> u64 {
        self.lists.get(list).map(|l| l.len() as u64).unwrap_or(0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.scalars
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_atomic_on_first_writer() {
        let kv = InMemoryKvStore::new();
        assert!(kv.set_if_absent("k", "a".into(), None).await);
        assert!(!kv.set_if_absent("k", "b".into(), None).await);
        assert_eq!(kv.get("k").await, Some("a".into()));
    }

    #[tokio::test]
    async fn expired_entry_behaves_as_absent() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "a".into(), Some(Duration::from_millis(1)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await, None);
        assert!(kv.set_if_absent("k", "b".into(), None).await);
    }

    #[tokio::test]
    async fn incr_accumulates() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr("c", 1, None).await, 1);
        assert_eq!(kv.incr("c", 1, None).await, 2);
        assert_eq!(kv.incr("c", 5, None).await, 7);
    }

    #[tokio::test]
    async fn keys_with_prefix_finds_only_live_matches() {
        let kv = InMemoryKvStore::new();
        kv.set("rollback:job-1", "a".into(), None).await;
        kv.set("rollback:job-2", "b".into(), Some(Duration::from_millis(1)))
            .await;
        kv.set("job_status:job-1", "c".into(), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut found = kv.keys_with_prefix("rollback:").await;
        found.sort();
        assert_eq!(found, vec!["rollback:job-1".to_string()]);
    }

    #[tokio::test]
    async fn lpush_rpop_is_fifo() {
        let kv = InMemoryKvStore::new();
        kv.lpush("q", "a".into()).await;
        kv.lpush("q", "b".into()).await;
        kv.lpush("q", "c".into()).await;
        assert_eq!(kv.llen("q").await, 3);
        assert_eq!(kv.rpop("q").await, Some("a".into()));
        assert_eq!(kv.rpop("q").await, Some("b".into()));
        assert_eq!(kv.rpop("q").await, Some("c".into()));
        assert_eq!(kv.rpop("q").await, None);
    }
}
