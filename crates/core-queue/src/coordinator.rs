//! [`KeyedCoordinator`]: the narrow contract [`crate::DistributedQueue`] needs
//! from an external keyed store (Redis, in production).
//!
//! No concrete wire client lives in this crate — only the trait and an
//! in-memory test double ([`InMemoryCoordinator`]) used by this crate's own
//! tests and by anything exercising [`crate::DistributedQueue`] without a
//! real coordinator running.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator unreachable: {0}")]
    Unreachable(String),
    #[error("conditional operation precondition failed")]
    PreconditionFailed,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// A member of a sorted set, paired with its ordering score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// External keyed store exposing atomic compare-and-set, counters, sorted
/// sets, TTL, and scripted transactions, as required by [`crate::DistributedQueue`].
#[async_trait]
pub trait KeyedCoordinator: Send + Sync {
    /// `SET key value NX PX ttl`. Returns `true` if the key was set (i.e. it
    /// was absent), `false` if it already held a value.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<bool>;

    /// Delete `key` only if its current value equals `value`.
    async fn delete_if(&self, key: &str, value: &str) -> CoordinatorResult<bool>;

    /// Refresh `key`'s TTL only if its current value equals `value`.
    async fn expire_if(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<bool>;

    /// Add `member` to the sorted set at `key` with `score`, or update its score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoordinatorResult<()>;

    /// Remove `member` from the sorted set at `key`.
    async fn zrem(&self, key: &str, member: &str) -> CoordinatorResult<()>;

    /// Highest-scoring member of the sorted set at `key`, if any.
    async fn zpop_max(&self, key: &str) -> CoordinatorResult<Option<ScoredMember>>;

    /// All members with score in `..= max_score`, ascending by score.
    async fn zrange_by_score(&self, key: &str, max_score: f64) -> CoordinatorResult<Vec<ScoredMember>>;

    /// Add `member` to the set at `key`.
    async fn sadd(&self, key: &str, member: &str) -> CoordinatorResult<()>;

    /// Remove `member` from the set at `key`.
    async fn srem(&self, key: &str, member: &str) -> CoordinatorResult<()>;

    /// Cardinality of the set at `key`.
    async fn scard(&self, key: &str) -> CoordinatorResult<u64>;

    /// Write a field in the hash at `key`.
    async fn hset(&self, key: &str, field: &str, value: &str) -> CoordinatorResult<()>;

    /// Read a field from the hash at `key`.
    async fn hget(&self, key: &str, field: &str) -> CoordinatorResult<Option<String>>;

    /// Entire hash at `key`.
    async fn hgetall(&self, key: &str) -> CoordinatorResult<BTreeMap<String, String>>;

    /// Liveness check.
    async fn ping(&self) -> CoordinatorResult<()>;
}

/// In-memory stand-in for a real keyed coordinator, used by tests and by
/// anything that wants [`crate::DistributedQueue`]'s exact semantics without
/// standing up Redis.
#[derive(Default)]
pub struct InMemoryCoordinator {
    strings: Mutex<HashMap<String, (String, Option<Instant>)>>,
    zsets: Mutex<HashMap<String, Vec<ScoredMember>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
    reachable: std::sync::atomic::AtomicBool,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let c = Self::default();
        c.reachable.store(true, std::sync::atomic::Ordering::SeqCst);
        c
    }

    /// Test hook: simulate the coordinator going unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_reachable(&self) -> CoordinatorResult<()> {
        if self.reachable.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::Unreachable("simulated outage".into()))
        }
    }

    fn string_live(&self, map: &HashMap<String, (String, Option<Instant>)>, key: &str) -> Option<String> {
        map.get(key).and_then(|(v, expires)| match expires {
            Some(t) if *t <= Instant::now() => None,
            _ => Some(v.clone()),
        })
    }
}

#[async_trait]
impl KeyedCoordinator for InMemoryCoordinator {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<bool> {
        self.check_reachable()?;
        let mut strings = self.strings.lock().unwrap();
        if self.string_live(&strings, key).is_some() {
            return Ok(false);
        }
        strings.insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn delete_if(&self, key: &str, value: &str) -> CoordinatorResult<bool> {
        self.check_reachable()?;
        let mut strings = self.strings.lock().unwrap();
        if self.string_live(&strings, key).as_deref() == Some(value) {
            strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn expire_if(&self, key: &str, value: &str, ttl: Duration) -> CoordinatorResult<bool> {
        self.check_reachable()?;
        let mut strings = self.strings.lock().unwrap();
        if self.string_live(&strings, key).as_deref() == Some(value) {
            strings.insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoordinatorResult<()> {
        self.check_reachable()?;
        let mut zsets = self.zsets.lock().unwrap();
        let set = zsets.entry(key.to_string()).or_default();
        set.retain(|m| m.member != member);
        set.push(ScoredMember { member: member.to_string(), score });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> CoordinatorResult<()> {
        self.check_reachable()?;
        if let Some(set) = self.zsets.lock().unwrap().get_mut(key) {
            set.retain(|m| m.member != member);
        }
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> CoordinatorResult<Option<ScoredMember>> {
        self.check_reachable()?;
        let mut zsets = self.zsets.lock().unwrap();
        let set = zsets.entry(key.to_string()).or_default();
        if set.is_empty() {
            return Ok(None);
        }
        let (idx, _) = set
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap())
            .unwrap();
        Ok(Some(set.remove(idx)))
    }

    async fn zrange_by_score(&self, key: &str, max_score: f64) -> CoordinatorResult<Vec<ScoredMember>> {
        self.check_reachable()?;
        let zsets = self.zsets.lock().unwrap();
        let mut out: Vec<ScoredMember> = zsets
            .get(key)
            .map(|set| set.iter().filter(|m| m.score <= max_score).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
        Ok(out)
    }

    async fn sadd(&self, key: &str, member: &str) -> CoordinatorResult<()> {
        self.check_reachable()?;
        self.sets.lock().unwrap().entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> CoordinatorResult<()> {
        self.check_reachable()?;
        if let Some(set) = self.sets.lock().unwrap().get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn scard(&self, key: &str) -> CoordinatorResult<u64> {
        self.check_reachable()?;
        Ok(self.sets.lock().unwrap().get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CoordinatorResult<()> {
        self.check_reachable()?;
        self.hashes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CoordinatorResult<Option<String>> {
        self.check_reachable()?;
        Ok(self.hashes.lock().unwrap().get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> CoordinatorResult<BTreeMap<String, String>> {
        self.check_reachable()?;
        Ok(self.hashes.lock().unwrap().get(key).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> CoordinatorResult<()> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_released() {
        let c = InMemoryCoordinator::new();
        assert!(c.set_nx("lock:a", "tok1", Duration::from_secs(30)).await.unwrap());
        assert!(!c.set_nx("lock:a", "tok2", Duration::from_secs(30)).await.unwrap());
        assert!(c.delete_if("lock:a", "tok1").await.unwrap());
        assert!(c.set_nx("lock:a", "tok2", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn zpop_max_returns_highest_priority_first() {
        let c = InMemoryCoordinator::new();
        c.zadd("queue:pending", "job-low", 10.0).await.unwrap();
        c.zadd("queue:pending", "job-high", 100.0).await.unwrap();
        let top = c.zpop_max("queue:pending").await.unwrap().unwrap();
        assert_eq!(top.member, "job-high");
    }

    #[tokio::test]
    async fn ping_fails_when_simulated_unreachable() {
        let c = InMemoryCoordinator::new();
        c.set_reachable(false);
        assert!(c.ping().await.is_err());
    }
}
