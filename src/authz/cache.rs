//! Two-tier cache of decisions and resolved role sets.
//!
//! The in-process tier is a sharded map owned by this engine instance. The
//! shared tier is any [`DistributedCache`]; its entries are stamped with the
//! subject epoch and the policy epoch current when the value was computed, and
//! a lookup only accepts an entry whose stamps still match. Invalidating a
//! role or permission therefore only has to replace `epoch:policy`, and
//! invalidating a subject only `epoch:subject:{id}`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::authz::errors::SharedCacheError;
use crate::authz::resolver::ResolvedRoles;
use crate::authz::types::*;

pub const POLICY_EPOCH_KEY: &str = "epoch:policy";

pub fn decision_key(subject: &str, resource: &str, action: &str, scope: Scope) -> String {
    format!("decision:{subject}:{resource}:{action}:{scope}")
}

pub fn roles_key(subject: &str) -> String {
    format!("roles:{subject}")
}

pub fn subject_epoch_key(subject: &str) -> String {
    format!("epoch:subject:{subject}")
}

// ---------- Shared tier ----------

#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError>;
    async fn delete(&self, key: &str) -> Result<(), SharedCacheError>;
}

#[async_trait]
impl<T: DistributedCache + ?Sized> DistributedCache for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), SharedCacheError> {
        (**self).delete(key).await
    }
}

/// Shared tier kept in process. Useful for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryDistributedCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => Some(entry.0.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SharedCacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Shared tier backed by Redis.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, SharedCacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SharedCacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

// ---------- Decision cache ----------

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub local_ttl: Duration,
    pub shared_ttl: Duration,
    pub local_capacity: usize,
    pub shared_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(30),
            shared_ttl: Duration::from_secs(300),
            local_capacity: 10_000,
            shared_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalEntry<T> {
    value: T,
    subject: SubjectId,
    expires_at: DateTime<Utc>,
    /// Invalidation generation the value was computed under.
    generation: u64,
}

/// Envelope stored in the shared tier.
#[derive(Debug, Serialize, Deserialize)]
struct SharedEntry<T> {
    subject_epoch: Option<String>,
    policy_epoch: Option<String>,
    expires_at: DateTime<Utc>,
    value: T,
}

/// A decision together with the role set it was computed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedDecision {
    decision: Decision,
    roles: BTreeSet<RoleId>,
}

/// Cached values know the roles they were derived from.
trait CacheValue: Clone + Serialize + DeserializeOwned {
    fn roles(&self) -> &BTreeSet<RoleId>;
}

impl CacheValue for CachedDecision {
    fn roles(&self) -> &BTreeSet<RoleId> {
        &self.roles
    }
}

impl CacheValue for ResolvedRoles {
    fn roles(&self) -> &BTreeSet<RoleId> {
        &self.roles
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Epochs {
    subject: Option<String>,
    policy: Option<String>,
}

/// Handed out on a miss and required to populate. Carries what the lookup
/// observed so a value computed across an invalidation is never stored.
#[derive(Debug, Clone)]
pub struct MissToken {
    generation: u64,
    epochs: Option<Epochs>,
}

#[derive(Debug)]
pub enum Lookup<T> {
    Hit(T),
    Miss(MissToken),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_entries: usize,
    pub local_hits: u64,
    pub local_misses: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub shared_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,
    shared_errors: AtomicU64,
}

pub struct DecisionCache {
    config: CacheConfig,
    decisions: DashMap<String, LocalEntry<CachedDecision>>,
    roles: DashMap<SubjectId, LocalEntry<ResolvedRoles>>,
    shared: Option<Box<dyn DistributedCache>>,
    /// Bumped on every invalidation handled by this instance.
    generation: AtomicU64,
    epoch_counter: AtomicU64,
    /// While set, the shared tier may hold entries an invalidation failed to retire.
    shared_untrusted_until: Mutex<Option<Instant>>,
    counters: Counters,
}

impl DecisionCache {
    pub fn new(config: CacheConfig, shared: Option<Box<dyn DistributedCache>>) -> Self {
        Self {
            config,
            decisions: DashMap::new(),
            roles: DashMap::new(),
            shared,
            generation: AtomicU64::new(0),
            epoch_counter: AtomicU64::new(0),
            shared_untrusted_until: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn local_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: self.decisions.len() + self.roles.len(),
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            local_misses: self.counters.local_misses.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            shared_misses: self.counters.shared_misses.load(Ordering::Relaxed),
            shared_errors: self.counters.shared_errors.load(Ordering::Relaxed),
        }
    }

    pub async fn get_decision(&self, key: &str, subject: &str) -> Lookup<Decision> {
        match self.lookup(&self.decisions, key, subject).await {
            Lookup::Hit(cached) => Lookup::Hit(cached.decision),
            Lookup::Miss(token) => Lookup::Miss(token),
        }
    }

    pub async fn put_decision(
        &self,
        key: &str,
        subject: &str,
        roles: &BTreeSet<RoleId>,
        decision: &Decision,
        expires_at: Option<DateTime<Utc>>,
        token: MissToken,
    ) {
        let value = CachedDecision {
            decision: decision.clone(),
            roles: roles.clone(),
        };
        self.populate(&self.decisions, key, subject, value, expires_at, token)
            .await;
    }

    pub async fn get_roles(&self, subject: &str) -> Lookup<ResolvedRoles> {
        let key = roles_key(subject);
        self.lookup(&self.roles, &key, subject).await
    }

    pub async fn put_roles(&self, subject: &str, resolved: &ResolvedRoles, token: MissToken) {
        let key = roles_key(subject);
        self.populate(
            &self.roles,
            &key,
            subject,
            resolved.clone(),
            resolved.valid_until,
            token,
        )
        .await;
    }

    /// Drop everything `invalidation` may have made stale, here and in the
    /// shared tier. An empty invalidation flushes both tiers' contents.
    pub async fn invalidate(&self, invalidation: &Invalidation) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        if invalidation.is_empty() {
            self.decisions.clear();
            self.roles.clear();
            self.bump_epoch(POLICY_EPOCH_KEY).await;
            tracing::info!("decision cache flushed");
            return;
        }

        if let Some(subject) = &invalidation.subject {
            self.decisions.retain(|_, e| e.subject != *subject);
            self.roles.retain(|_, e| e.subject != *subject);
            let key = roles_key(subject);
            if let Some(shared) = &self.shared {
                if let Err(e) = self.shared_op("delete", shared.delete(&key)).await {
                    tracing::warn!(key = %key, error = %e, "failed to delete shared role set");
                }
            }
            self.bump_epoch(&subject_epoch_key(subject)).await;
        }

        if let Some(role) = &invalidation.role {
            self.decisions.retain(|_, e| !e.value.roles().contains(role));
            self.roles.retain(|_, e| !e.value.roles().contains(role));
        }

        if invalidation.permission.is_some() {
            // a permission change can turn any decision, including no-match denials
            self.decisions.clear();
        }

        if invalidation.role.is_some() || invalidation.permission.is_some() {
            self.bump_epoch(POLICY_EPOCH_KEY).await;
        }

        tracing::debug!(
            subject = ?invalidation.subject,
            role = ?invalidation.role,
            permission = ?invalidation.permission,
            "cache invalidated"
        );
    }

    /// Remove expired in-process entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.decisions.len() + self.roles.len();
        self.decisions.retain(|_, e| e.expires_at > now);
        self.roles.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.decisions.len() + self.roles.len())
    }

    // ---------- internals ----------

    async fn lookup<T: CacheValue>(
        &self,
        local: &DashMap<String, LocalEntry<T>>,
        key: &str,
        subject: &str,
    ) -> Lookup<T> {
        let generation = self.generation.load(Ordering::SeqCst);
        let now = Utc::now();

        if let Some(entry) = local.get(key) {
            if entry.expires_at > now {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "local cache hit");
                return Lookup::Hit(entry.value.clone());
            }
        }
        self.counters.local_misses.fetch_add(1, Ordering::Relaxed);

        let Some(shared) = self.shared_if_trusted() else {
            return Lookup::Miss(MissToken {
                generation,
                epochs: None,
            });
        };

        let epoch_key = subject_epoch_key(subject);
        let (entry, subject_epoch, policy_epoch) = tokio::join!(
            self.shared_op("get", shared.get(key)),
            self.shared_op("get", shared.get(&epoch_key)),
            self.shared_op("get", shared.get(POLICY_EPOCH_KEY)),
        );

        let (entry, epochs) = match (entry, subject_epoch, policy_epoch) {
            (Ok(entry), Ok(subject_epoch), Ok(policy_epoch)) => (
                entry,
                Epochs {
                    subject: subject_epoch.map(|b| String::from_utf8_lossy(&b).into_owned()),
                    policy: policy_epoch.map(|b| String::from_utf8_lossy(&b).into_owned()),
                },
            ),
            (a, b, c) => {
                for e in [a.err(), b.err(), c.err()].into_iter().flatten() {
                    tracing::warn!(key, error = %e, "shared cache unavailable, recomputing");
                }
                return Lookup::Miss(MissToken {
                    generation,
                    epochs: None,
                });
            }
        };

        let token = MissToken {
            generation,
            epochs: Some(epochs.clone()),
        };

        let Some(bytes) = entry else {
            self.counters.shared_misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss(token);
        };

        let shared_entry: SharedEntry<T> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %SharedCacheError::from(e), "discarding shared entry");
                return Lookup::Miss(token);
            }
        };

        let fresh = shared_entry.subject_epoch == epochs.subject
            && shared_entry.policy_epoch == epochs.policy
            && shared_entry.expires_at > now;
        if !fresh || self.generation.load(Ordering::SeqCst) != generation {
            self.counters.shared_misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss(token);
        }

        self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "shared cache hit");

        let local_expiry = shared_entry.expires_at.min(now + to_chrono(self.config.local_ttl));
        self.insert_local(
            local,
            key,
            LocalEntry {
                value: shared_entry.value.clone(),
                subject: subject.to_string(),
                expires_at: local_expiry,
                generation,
            },
        );
        Lookup::Hit(shared_entry.value)
    }

    async fn populate<T: CacheValue>(
        &self,
        local: &DashMap<String, LocalEntry<T>>,
        key: &str,
        subject: &str,
        value: T,
        expires_at: Option<DateTime<Utc>>,
        token: MissToken,
    ) {
        let now = Utc::now();
        let cap = |ttl: Duration| {
            let by_ttl = now + to_chrono(ttl);
            expires_at.map_or(by_ttl, |e| e.min(by_ttl))
        };

        if self.generation.load(Ordering::SeqCst) != token.generation {
            tracing::debug!(key, "invalidated while computing, not caching");
            return;
        }

        let local_expiry = cap(self.config.local_ttl);
        if local_expiry > now {
            let kept = self.insert_local(
                local,
                key,
                LocalEntry {
                    value: value.clone(),
                    subject: subject.to_string(),
                    expires_at: local_expiry,
                    generation: token.generation,
                },
            );
            if !kept {
                tracing::debug!(key, "invalidated while caching, withdrawn");
                return;
            }
        }

        let (Some(shared), Some(epochs)) = (self.shared_if_trusted(), token.epochs) else {
            return;
        };
        let shared_expiry = cap(self.config.shared_ttl);
        let Ok(ttl) = (shared_expiry - now).to_std() else {
            return;
        };
        if ttl.is_zero() {
            return;
        }

        let entry = SharedEntry {
            subject_epoch: epochs.subject,
            policy_epoch: epochs.policy,
            expires_at: shared_expiry,
            value,
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to encode shared entry");
                return;
            }
        };
        if let Err(e) = self.shared_op("set", shared.set(key, bytes, ttl)).await {
            tracing::warn!(key, error = %e, "failed to populate shared cache");
        }
    }

    /// Insert `entry`, then withdraw it if an invalidation started after its
    /// generation was read. An invalidation either bumps the generation
    /// before the re-read here or purges after the insert, so a stale value
    /// never survives. Returns whether the entry was kept.
    fn insert_local<T>(
        &self,
        local: &DashMap<String, LocalEntry<T>>,
        key: &str,
        entry: LocalEntry<T>,
    ) -> bool {
        let generation = entry.generation;
        self.make_room(local);
        local.insert(key.to_string(), entry);
        if self.generation.load(Ordering::SeqCst) == generation {
            return true;
        }
        local.remove_if(key, |_, e| e.generation == generation);
        false
    }

    fn make_room<T>(&self, local: &DashMap<String, LocalEntry<T>>) {
        if local.len() < self.config.local_capacity {
            return;
        }
        let now = Utc::now();
        local.retain(|_, e| e.expires_at > now);
        if local.len() < self.config.local_capacity {
            return;
        }
        let victim = local.iter().next().map(|e| e.key().clone());
        if let Some(victim) = victim {
            local.remove(&victim);
        }
    }

    fn shared_if_trusted(&self) -> Option<&dyn DistributedCache> {
        let shared = self.shared.as_deref()?;
        let mut untrusted = self.shared_untrusted_until.lock();
        match *untrusted {
            Some(until) if Instant::now() < until => None,
            Some(_) => {
                *untrusted = None;
                Some(shared)
            }
            None => Some(shared),
        }
    }

    async fn bump_epoch(&self, key: &str) {
        let Some(shared) = &self.shared else {
            return;
        };
        let epoch = format!(
            "{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            self.epoch_counter.fetch_add(1, Ordering::Relaxed)
        );
        let ttl = self.config.shared_ttl * 2;
        if let Err(e) = self
            .shared_op("set", shared.set(key, epoch.into_bytes(), ttl))
            .await
        {
            // entries stamped with the old epoch may survive in the shared tier
            tracing::warn!(key, error = %e, "failed to advance epoch, bypassing shared cache");
            *self.shared_untrusted_until.lock() = Some(Instant::now() + self.config.shared_ttl);
        }
    }

    async fn shared_op<T, F>(&self, operation: &str, fut: F) -> Result<T, SharedCacheError>
    where
        F: Future<Output = Result<T, SharedCacheError>>,
    {
        let result = match tokio::time::timeout(self.config.shared_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SharedCacheError::Timeout(self.config.shared_timeout)),
        };
        if let Err(e) = &result {
            self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation, error = %e, "shared cache operation failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn decision(allowed: bool) -> Decision {
        if allowed {
            Decision::allow("p".into(), DecisionReason::RoleGrant, Utc::now())
        } else {
            Decision::deny(None, DecisionReason::NoMatchingPermission, Utc::now())
        }
    }

    fn roles(ids: &[&str]) -> BTreeSet<RoleId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn miss<T: std::fmt::Debug>(lookup: Lookup<T>) -> MissToken {
        match lookup {
            Lookup::Miss(token) => token,
            Lookup::Hit(v) => panic!("expected miss, got {v:?}"),
        }
    }

    fn is_hit<T>(lookup: &Lookup<T>) -> bool {
        matches!(lookup, Lookup::Hit(_))
    }

    struct Broken;

    #[async_trait]
    impl DistributedCache for Broken {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
            Err(SharedCacheError::Backend("connection refused".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), SharedCacheError> {
            Err(SharedCacheError::Backend("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), SharedCacheError> {
            Err(SharedCacheError::Backend("connection refused".into()))
        }
    }

    /// Two engine instances sharing one distributed tier.
    fn pair() -> (DecisionCache, DecisionCache) {
        let backing = Arc::new(MemoryDistributedCache::new());
        (
            DecisionCache::new(CacheConfig::default(), Some(Box::new(backing.clone()))),
            DecisionCache::new(CacheConfig::default(), Some(Box::new(backing))),
        )
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(
            decision_key("u1", "batch", "submit", Scope::Own),
            "decision:u1:batch:submit:self"
        );
        assert_eq!(roles_key("u1"), "roles:u1");
        assert_eq!(subject_epoch_key("u1"), "epoch:subject:u1");
    }

    #[tokio::test]
    async fn test_local_hit_after_populate() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(cache.get_decision(&key, "u1").await);
        cache
            .put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
            .await;

        match cache.get_decision(&key, "u1").await {
            Lookup::Hit(d) => assert!(d.allowed),
            Lookup::Miss(_) => panic!("expected hit"),
        }
        let stats = cache.stats();
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.local_misses, 1);
    }

    #[tokio::test]
    async fn test_populate_skipped_after_concurrent_invalidation() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(cache.get_decision(&key, "u1").await);
        cache.invalidate(&Invalidation::subject("u1")).await;
        cache
            .put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
            .await;

        assert!(!is_hit(&cache.get_decision(&key, "u1").await));
    }

    #[test]
    fn test_insert_overtaken_by_invalidation_is_withdrawn() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let key = decision_key("u1", "batch", "submit", Scope::Organization);
        let entry = |generation| LocalEntry {
            value: CachedDecision {
                decision: decision(true),
                roles: roles(&["operator"]),
            },
            subject: "u1".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
            generation,
        };

        // generation read, then an invalidation lands before the insert
        let observed = cache.generation.load(Ordering::SeqCst);
        cache.generation.fetch_add(1, Ordering::SeqCst);
        cache.decisions.retain(|_, e| e.subject != "u1");

        assert!(!cache.insert_local(&cache.decisions, &key, entry(observed)));
        assert!(cache.decisions.get(&key).is_none());

        let current = cache.generation.load(Ordering::SeqCst);
        assert!(cache.insert_local(&cache.decisions, &key, entry(current)));
        assert!(cache.decisions.get(&key).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_populate_never_outlives_invalidation() {
        let cache = Arc::new(DecisionCache::local_only(CacheConfig::default()));
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        for _ in 0..200 {
            let token = miss(cache.get_decision(&key, "u1").await);
            let writer = {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
                        .await;
                })
            };
            cache.invalidate(&Invalidation::subject("u1")).await;
            writer.await.unwrap();

            assert!(
                !is_hit(&cache.get_decision(&key, "u1").await),
                "value computed before the invalidation was served"
            );
        }
    }

    #[tokio::test]
    async fn test_subject_invalidation_is_targeted() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        for subject in ["u1", "u2"] {
            let key = decision_key(subject, "batch", "submit", Scope::Organization);
            let token = miss(cache.get_decision(&key, subject).await);
            cache
                .put_decision(&key, subject, &roles(&["operator"]), &decision(true), None, token)
                .await;
        }

        cache.invalidate(&Invalidation::subject("u1")).await;

        let k1 = decision_key("u1", "batch", "submit", Scope::Organization);
        let k2 = decision_key("u2", "batch", "submit", Scope::Organization);
        assert!(!is_hit(&cache.get_decision(&k1, "u1").await));
        assert!(is_hit(&cache.get_decision(&k2, "u2").await));
    }

    #[tokio::test]
    async fn test_role_invalidation_drops_dependents() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let k1 = decision_key("u1", "batch", "submit", Scope::Organization);
        let k2 = decision_key("u2", "batch", "submit", Scope::Organization);

        let t1 = miss(cache.get_decision(&k1, "u1").await);
        cache
            .put_decision(&k1, "u1", &roles(&["operator", "viewer"]), &decision(true), None, t1)
            .await;
        let t2 = miss(cache.get_decision(&k2, "u2").await);
        cache
            .put_decision(&k2, "u2", &roles(&["auditor"]), &decision(false), None, t2)
            .await;

        cache.invalidate(&Invalidation::role("viewer")).await;

        assert!(!is_hit(&cache.get_decision(&k1, "u1").await));
        assert!(is_hit(&cache.get_decision(&k2, "u2").await));
    }

    #[tokio::test]
    async fn test_shared_tier_serves_other_instance() {
        let (a, b) = pair();
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(a.get_decision(&key, "u1").await);
        a.put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
            .await;

        assert!(is_hit(&b.get_decision(&key, "u1").await));
        assert_eq!(b.stats().shared_hits, 1);
    }

    #[tokio::test]
    async fn test_policy_epoch_retires_shared_entries() {
        let (a, b) = pair();
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(a.get_decision(&key, "u1").await);
        a.put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
            .await;

        // b holds nothing locally for the role, so only the epoch can retire the entry
        b.invalidate(&Invalidation::permission("p")).await;
        assert!(!is_hit(&b.get_decision(&key, "u1").await));

        // a still has its own local copy; its instance was not told
        a.invalidate(&Invalidation::permission("p")).await;
        assert!(!is_hit(&a.get_decision(&key, "u1").await));
    }

    #[tokio::test]
    async fn test_subject_epoch_retires_shared_roles() {
        let (a, b) = pair();
        let resolved = ResolvedRoles {
            roles: roles(&["operator"]),
            ..Default::default()
        };

        let token = miss(a.get_roles("u1").await);
        a.put_roles("u1", &resolved, token).await;
        assert!(is_hit(&b.get_roles("u1").await));

        b.invalidate(&Invalidation::subject("u1")).await;
        assert!(!is_hit(&b.get_roles("u1").await));
    }

    #[tokio::test]
    async fn test_broken_shared_tier_falls_back() {
        let cache = DecisionCache::new(CacheConfig::default(), Some(Box::new(Broken)));
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(cache.get_decision(&key, "u1").await);
        cache
            .put_decision(&key, "u1", &roles(&["operator"]), &decision(true), None, token)
            .await;

        // the local tier still works
        assert!(is_hit(&cache.get_decision(&key, "u1").await));
        assert!(cache.stats().shared_errors >= 3);

        // a failed epoch bump stops trusting the shared tier, invalidation still applies locally
        cache.invalidate(&Invalidation::subject("u1")).await;
        assert!(!is_hit(&cache.get_decision(&key, "u1").await));
    }

    #[tokio::test]
    async fn test_expiry_bounded_by_caller() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let key = decision_key("u1", "batch", "submit", Scope::Organization);

        let token = miss(cache.get_decision(&key, "u1").await);
        let past = Utc::now() - chrono::Duration::seconds(1);
        cache
            .put_decision(&key, "u1", &roles(&[]), &decision(true), Some(past), token)
            .await;
        assert!(!is_hit(&cache.get_decision(&key, "u1").await));
    }

    #[tokio::test]
    async fn test_sweep_and_capacity() {
        let config = CacheConfig {
            local_capacity: 2,
            ..CacheConfig::default()
        };
        let cache = DecisionCache::local_only(config);
        for action in ["a", "b", "c"] {
            let key = decision_key("u1", "batch", action, Scope::Organization);
            let token = miss(cache.get_decision(&key, "u1").await);
            cache
                .put_decision(&key, "u1", &roles(&[]), &decision(true), None, token)
                .await;
        }
        assert_eq!(cache.stats().local_entries, 2);

        let soon = Utc::now() + chrono::Duration::milliseconds(20);
        let key = decision_key("u2", "batch", "a", Scope::Organization);
        let token = miss(cache.get_decision(&key, "u2").await);
        cache
            .put_decision(&key, "u2", &roles(&[]), &decision(true), Some(soon), token)
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.sweep_expired() >= 1);
    }

    #[tokio::test]
    async fn test_empty_invalidation_flushes() {
        let cache = DecisionCache::local_only(CacheConfig::default());
        let key = decision_key("u1", "batch", "submit", Scope::Organization);
        let token = miss(cache.get_decision(&key, "u1").await);
        cache
            .put_decision(&key, "u1", &roles(&[]), &decision(true), None, token)
            .await;

        cache.invalidate(&Invalidation::default()).await;
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_memory_shared_tier_expires() {
        let shared = MemoryDistributedCache::new();
        shared
            .set("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(shared.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(shared.get("k").await.unwrap(), None);
        assert!(shared.is_empty());
    }
}
