use crate::keys::QueryKey;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

// Freshness horizons applied when a value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub stale_after: Duration,
    pub expire_after: Duration,
}

impl Freshness {
    // `stale_after` is clamped so an entry never goes stale after it expires.
    pub fn new(stale_after: Duration, expire_after: Duration) -> Self {
        Self {
            stale_after: stale_after.min(expire_after),
            expire_after,
        }
    }

    pub fn ttl(ttl: Duration) -> Self {
        Self::new(ttl, ttl)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub value: Value,
    pub inserted_at: Instant,
    pub stale_at: Instant,
    pub expire_at: Instant,
    // Mutation whose optimistic patch currently occupies this entry.
    pub owner: Option<Uuid>,
}

impl CacheEntry {
    fn new(key: QueryKey, value: Value, freshness: Freshness, now: Instant) -> Self {
        Self {
            key,
            value,
            inserted_at: now,
            stale_at: now + freshness.stale_after,
            expire_at: now + freshness.expire_after,
            owner: None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Value),
    // Servable, but a refresh should be started.
    Stale(Value),
    Miss,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Invalidation {
    pub removed: Vec<QueryKey>,
    // Entries skipped because an unresolved optimistic patch owns them.
    pub deferred: Vec<QueryKey>,
}

#[derive(Debug, Clone)]
pub enum PatchTarget {
    // Every live entry under the prefix.
    Prefix(QueryKey),
    // One key, created if absent.
    Exact(QueryKey),
}

pub type PatchFn = Arc<dyn Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync>;

// Speculative edit. The function returns `None` to leave a value untouched.
#[derive(Clone)]
pub struct Patch {
    pub target: PatchTarget,
    pub apply: PatchFn,
}

impl Patch {
    pub fn prefix<F>(prefix: QueryKey, f: F) -> Self
    where
        F: Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            target: PatchTarget::Prefix(prefix),
            apply: Arc::new(f),
        }
    }

    pub fn exact<F>(key: QueryKey, f: F) -> Self
    where
        F: Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            target: PatchTarget::Exact(key),
            apply: Arc::new(f),
        }
    }
}

// Entry state captured before an optimistic patch touched it. `None` means absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: QueryKey,
    pub prior: Option<CacheEntry>,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    // Invalidations postponed per pending mutation.
    deferred: HashMap<Uuid, HashSet<QueryKey>>,
    // Mutations that have patched and not yet released.
    live: HashSet<Uuid>,
}

impl StoreInner {
    // Owner tag of `key` if that mutation is still unresolved.
    fn live_owner(&self, key: &QueryKey) -> Option<Uuid> {
        self.entries
            .get(key)
            .and_then(|e| e.owner)
            .filter(|owner| self.live.contains(owner))
    }
}

/// In-memory key/value store with per-entry staleness and expiry.
///
/// Every operation takes the lock once and never awaits while holding it, so each
/// call is atomic with respect to other tasks. Clones share the same entries.
#[derive(Debug, Default, Clone)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: QueryKey, value: Value, ttl: Duration) {
        self.put_with(key, value, Freshness::ttl(ttl));
    }

    pub fn put_with(&self, key: QueryKey, value: Value, freshness: Freshness) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner
            .entries
            .insert(key.clone(), CacheEntry::new(key, value, freshness, now));
    }

    // Write from a fetch. Refused while an optimistic patch owns the key.
    pub fn put_fetched(&self, key: QueryKey, value: Value, freshness: Freshness) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(owner) = inner.live_owner(&key) {
            debug!(%key, %owner, "fetch result dropped, key held by pending mutation");
            return false;
        }
        inner
            .entries
            .insert(key.clone(), CacheEntry::new(key, value, freshness, now));
        true
    }

    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        match self.lookup(key) {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(v),
            Lookup::Miss => None,
        }
    }

    pub fn lookup(&self, key: &QueryKey) -> Lookup {
        let now = Instant::now();
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get(key) else {
            return Lookup::Miss;
        };
        if entry.is_expired(now) {
            inner.entries.remove(key);
            return Lookup::Miss;
        }
        let held = entry.owner.is_some_and(|owner| inner.live.contains(&owner));
        if entry.is_stale(now) && !held {
            Lookup::Stale(entry.value.clone())
        } else {
            Lookup::Fresh(entry.value.clone())
        }
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Removes every entry whose key starts with `prefix`, the exact key included.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        before - inner.entries.len()
    }

    /// Prefix invalidation that skips entries owned by an unresolved mutation and
    /// remembers them, so the owner can apply the invalidation once it settles.
    pub fn invalidate_guarded(&self, prefix: &QueryKey) -> Invalidation {
        let mut inner = self.lock();
        let StoreInner { entries, deferred, live } = &mut *inner;
        let mut outcome = Invalidation::default();
        entries.retain(|key, entry| {
            if !key.starts_with(prefix) {
                return true;
            }
            match entry.owner.filter(|owner| live.contains(owner)) {
                Some(owner) => {
                    deferred.entry(owner).or_default().insert(key.clone());
                    outcome.deferred.push(key.clone());
                    true
                }
                None => {
                    outcome.removed.push(key.clone());
                    false
                }
            }
        });
        outcome
    }

    // Marks live entries under `prefix` stale without dropping their values.
    pub fn mark_stale(&self, prefix: &QueryKey) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut marked = 0;
        for entry in inner.entries.values_mut() {
            if entry.key.starts_with(prefix) && entry.stale_at > now {
                entry.stale_at = now;
                marked += 1;
            }
        }
        marked
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    // Drops all entries and pending bookkeeping.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.deferred.clear();
        inner.live.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Snapshots and patches every targeted entry in one critical section and tags
    /// the patched entries with `mutation_id`. A key hit by several patches is
    /// snapshotted once, before the first of them.
    pub(crate) fn apply_optimistic(
        &self,
        mutation_id: Uuid,
        patches: &[Patch],
        freshness: Freshness,
    ) -> Vec<Snapshot> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.retain(|_, e| !e.is_expired(now));
        inner.live.insert(mutation_id);

        let mut snapshots: Vec<Snapshot> = Vec::new();
        let mut seen: HashSet<QueryKey> = HashSet::new();

        for patch in patches {
            let targets: Vec<QueryKey> = match &patch.target {
                PatchTarget::Exact(key) => vec![key.clone()],
                PatchTarget::Prefix(prefix) => inner
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect(),
            };

            for key in targets {
                let current = inner.entries.get(&key);
                let Some(next) = (patch.apply)(&key, current.map(|e| &e.value)) else {
                    continue;
                };
                if seen.insert(key.clone()) {
                    snapshots.push(Snapshot {
                        key: key.clone(),
                        prior: current.cloned(),
                    });
                }
                let entry = inner
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| CacheEntry::new(key.clone(), Value::Null, freshness, now));
                entry.value = next;
                entry.owner = Some(mutation_id);
            }
        }
        snapshots
    }

    /// Puts every snapshotted entry back exactly as it was. Keys since taken over by
    /// another mutation are left to that mutation. Returns the restored count.
    ///
    /// A snapshot can hold the patch of an overlapping mutation that has settled
    /// in the meantime. That entry comes back untagged and already stale, since
    /// nothing will release it and its value is no longer trusted.
    pub(crate) fn restore(&self, mutation_id: Uuid, snapshots: &[Snapshot]) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut restored = 0;
        for snapshot in snapshots {
            let owned_elsewhere = inner
                .live_owner(&snapshot.key)
                .is_some_and(|owner| owner != mutation_id);
            if owned_elsewhere {
                continue;
            }
            match &snapshot.prior {
                Some(prior) => {
                    let mut entry = prior.clone();
                    if let Some(owner) = entry.owner.filter(|o| !inner.live.contains(o)) {
                        debug!(key = %snapshot.key, %owner, "restored patch outlived its mutation");
                        entry.owner = None;
                        entry.stale_at = entry.stale_at.min(now);
                    }
                    inner.entries.insert(snapshot.key.clone(), entry);
                }
                None => {
                    inner.entries.remove(&snapshot.key);
                }
            }
            restored += 1;
        }
        restored
    }

    /// Rewrites entries still owned by `mutation_id` with the reconciled value.
    pub(crate) fn reconcile<F>(&self, mutation_id: Uuid, keys: &[QueryKey], f: F) -> usize
    where
        F: Fn(&QueryKey, &Value) -> Option<Value>,
    {
        let mut inner = self.lock();
        let mut rewritten = 0;
        for key in keys {
            let Some(entry) = inner.entries.get_mut(key) else {
                continue;
            };
            if entry.owner != Some(mutation_id) {
                continue;
            }
            if let Some(next) = f(key, &entry.value) {
                entry.value = next;
                rewritten += 1;
            }
        }
        rewritten
    }

    /// Clears ownership held by `mutation_id` and hands back deferred invalidations.
    pub(crate) fn release(&self, mutation_id: Uuid) -> Vec<QueryKey> {
        let mut inner = self.lock();
        inner.live.remove(&mutation_id);
        for entry in inner.entries.values_mut() {
            if entry.owner == Some(mutation_id) {
                entry.owner = None;
            }
        }
        inner
            .deferred
            .remove(&mutation_id)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }
}
