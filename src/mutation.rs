use crate::cache::{Patch, Snapshot};
use crate::error::{MutationError, RemoteError};
use crate::keys::QueryKey;
use crate::query::QueryCacheManager;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    InFlight,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub mutation_id: Uuid,
    pub label: String,
    // Prefixes invalidated once the mutation commits.
    pub query_keys_affected: Vec<QueryKey>,
    // Prior values of every key the optimistic patch touched.
    pub optimistic_snapshot: Vec<Snapshot>,
    pub status: MutationStatus,
}

// (key, current optimistic value, server response) -> replacement.
pub type ReconcileFn = Arc<dyn Fn(&QueryKey, &Value, &Value) -> Option<Value> + Send + Sync>;

pub struct MutationOptions {
    label: String,
    affected_keys: Vec<QueryKey>,
    patches: Vec<Patch>,
    reconcile: Option<ReconcileFn>,
    rollback_on_error: bool,
}

impl MutationOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            affected_keys: Vec::new(),
            patches: Vec::new(),
            reconcile: None,
            rollback_on_error: true,
        }
    }

    pub fn invalidates(mut self, prefix: QueryKey) -> Self {
        self.affected_keys.push(prefix);
        self
    }

    pub fn patch(mut self, patch: Patch) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn reconcile<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryKey, &Value, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(f));
        self
    }

    pub fn rollback_on_error(mut self, rollback: bool) -> Self {
        self.rollback_on_error = rollback;
        self
    }
}

#[derive(Debug, Clone)]
pub struct MutationOutcome<T> {
    pub mutation_id: Uuid,
    pub value: T,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, PendingMutation>>>;

fn lock(m: &Mutex<HashMap<Uuid, PendingMutation>>) -> MutexGuard<'_, HashMap<Uuid, PendingMutation>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Rolls the patch back if the mutation future is dropped before it settles.
struct Unsettled {
    cache: QueryCacheManager,
    pending: PendingMap,
    mutation_id: Uuid,
    snapshots: Vec<Snapshot>,
    settled: bool,
}

impl Drop for Unsettled {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(mutation_id = %self.mutation_id, "mutation dropped before settling, rolling back");
        let store = self.cache.store();
        store.restore(self.mutation_id, &self.snapshots);
        // Invalidations deferred behind the patch still apply. Observed keys are
        // refetched only when a runtime is around to run the fetch.
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        for key in store.release(self.mutation_id) {
            if in_runtime {
                self.cache.invalidate(&key);
            } else {
                store.invalidate(&key);
            }
        }
        lock(&self.pending).remove(&self.mutation_id);
    }
}

/// Applies speculative cache edits around a remote write and reconciles them with
/// the outcome: server truth on success, the exact prior state on failure.
#[derive(Clone)]
pub struct MutationCoordinator {
    cache: QueryCacheManager,
    pending: PendingMap,
}

impl MutationCoordinator {
    pub fn new(cache: QueryCacheManager) -> Self {
        Self {
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &QueryCacheManager {
        &self.cache
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        lock(&self.pending).values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn mutate<T, Fut>(
        &self,
        options: MutationOptions,
        remote: Fut,
    ) -> Result<MutationOutcome<T>, MutationError>
    where
        T: Serialize,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mutation_id = Uuid::new_v4();
        let store = self.cache.store().clone();
        let MutationOptions {
            label,
            affected_keys,
            patches,
            reconcile,
            rollback_on_error,
        } = options;

        // Snapshot and patch happen under one lock, before anything awaits.
        let snapshots = store.apply_optimistic(mutation_id, &patches, self.cache.policy().freshness());
        debug!(%mutation_id, %label, patched = snapshots.len(), "optimistic patch applied");

        lock(&self.pending).insert(
            mutation_id,
            PendingMutation {
                mutation_id,
                label: label.clone(),
                query_keys_affected: affected_keys.clone(),
                optimistic_snapshot: snapshots.clone(),
                status: MutationStatus::InFlight,
            },
        );
        let mut unsettled = Unsettled {
            cache: self.cache.clone(),
            pending: self.pending.clone(),
            mutation_id,
            snapshots,
            settled: false,
        };

        let result = remote.await;
        unsettled.settled = true;
        let patched: Vec<QueryKey> = unsettled.snapshots.iter().map(|s| s.key.clone()).collect();

        let (status, outcome) = match result {
            Ok(value) => {
                if let Some(reconcile) = &reconcile {
                    match serde_json::to_value(&value) {
                        Ok(server) => {
                            store.reconcile(mutation_id, &patched, |key, current| {
                                reconcile(key, current, &server)
                            });
                        }
                        Err(e) => {
                            warn!(%mutation_id, %label, error = %e, "server value not serializable, skipping reconcile");
                        }
                    }
                }
                let deferred = store.release(mutation_id);
                for prefix in affected_keys.iter().chain(deferred.iter()) {
                    self.cache.invalidate(prefix);
                }
                info!(%mutation_id, %label, "mutation committed");
                (
                    MutationStatus::Committed,
                    Ok(MutationOutcome { mutation_id, value }),
                )
            }
            Err(source) => {
                if rollback_on_error {
                    let restored = store.restore(mutation_id, &unsettled.snapshots);
                    warn!(%mutation_id, %label, restored, error = %source, "mutation rolled back");
                } else {
                    // Patch stays; converge on server state instead.
                    for key in affected_keys.iter().chain(patched.iter()) {
                        self.cache.invalidate(key);
                    }
                    warn!(%mutation_id, %label, error = %source, "mutation failed, patch kept");
                }
                // Out-of-band invalidations that waited on this mutation still apply.
                for key in store.release(mutation_id) {
                    self.cache.invalidate(&key);
                }
                (
                    MutationStatus::RolledBack,
                    Err(MutationError::Rejected { mutation_id, source }),
                )
            }
        };

        lock(&self.pending).remove(&mutation_id);
        debug!(%mutation_id, ?status, "mutation settled");
        outcome
    }
}

pub fn temp_id() -> String {
    format!("temp-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, Freshness};
    use crate::config::QueryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator() -> MutationCoordinator {
        MutationCoordinator::new(QueryCacheManager::new(CacheStore::new(), QueryPolicy::default()))
    }

    fn list_key() -> QueryKey {
        QueryKey::new("issues").with("list").with(1i64)
    }

    fn append_item(item: Value) -> Patch {
        Patch::prefix(QueryKey::new("issues").with("list"), move |_, current| {
            let mut items = current?.as_array()?.clone();
            items.insert(0, item.clone());
            Some(Value::Array(items))
        })
    }

    fn replace_temp(temp: &'static str) -> impl Fn(&QueryKey, &Value, &Value) -> Option<Value> {
        move |_, current, server| {
            let items = current.as_array()?;
            Some(Value::Array(
                items
                    .iter()
                    .map(|i| if i["id"] == temp { server.clone() } else { i.clone() })
                    .collect(),
            ))
        }
    }

    #[tokio::test]
    async fn success_swaps_the_temporary_id_for_the_server_id() {
        let c = coordinator();
        let store = c.cache().store().clone();
        store.put(list_key(), json!([{"id": "srv-1"}]), Duration::from_secs(60));
        store.put(QueryKey::new("issues").with("stats"), json!({"total": 1}), Duration::from_secs(60));

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Value, RemoteError>>();
        let options = MutationOptions::new("create-issue")
            .patch(append_item(json!({"id": "temp-123"})))
            .reconcile(replace_temp("temp-123"))
            .invalidates(QueryKey::new("issues").with("stats"));

        let task = tokio::spawn({
            let c = c.clone();
            async move { c.mutate(options, async move { rx.await.unwrap() }).await }
        });
        tokio::task::yield_now().await;

        // Optimistic value is visible while the remote call is pending.
        assert_eq!(store.get(&list_key()), Some(json!([{"id": "temp-123"}, {"id": "srv-1"}])));
        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.pending()[0].status, MutationStatus::InFlight);

        tx.send(Ok(json!({"id": "srv-456"}))).unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.value, json!({"id": "srv-456"}));

        let list = store.get(&list_key()).unwrap();
        assert_eq!(list, json!([{"id": "srv-456"}, {"id": "srv-1"}]));
        assert!(!list.to_string().contains("temp-123"));
        assert_eq!(store.get(&QueryKey::new("issues").with("stats")), None);
        assert_eq!(c.pending_count(), 0);
        assert!(store.entry(&list_key()).unwrap().owner.is_none());
    }

    #[tokio::test]
    async fn failure_restores_every_touched_key_exactly() {
        let c = coordinator();
        let store = c.cache().store().clone();
        let detail = QueryKey::new("issues").with("detail").with("9");
        store.put(list_key(), json!([{"id": "a"}]), Duration::from_secs(60));
        store.put(QueryKey::new("issues").with("stats"), json!({"total": 1}), Duration::from_secs(60));
        let before_list = store.entry(&list_key());

        let options = MutationOptions::new("create-issue")
            .patch(append_item(json!({"id": "temp-1"})))
            .patch(Patch::exact(detail.clone(), |_, _| Some(json!({"id": "temp-1"}))))
            .invalidates(QueryKey::new("issues").with("stats"));
        let err = c
            .mutate::<Value, _>(options, async { Err(RemoteError::client(400, "title required")) })
            .await
            .unwrap_err();

        assert_eq!(err.remote(), &RemoteError::client(400, "title required"));
        assert_eq!(store.entry(&list_key()), before_list);
        assert_eq!(store.get(&detail), None);
        // Nothing is invalidated on failure.
        assert!(store.get(&QueryKey::new("issues").with("stats")).is_some());
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn realtime_invalidation_waits_for_the_pending_mutation() {
        let c = coordinator();
        let store = c.cache().store().clone();
        store.put(list_key(), json!([]), Duration::from_secs(60));

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Value, RemoteError>>();
        let options = MutationOptions::new("create-issue").patch(append_item(json!({"id": "temp-7"})));
        let task = tokio::spawn({
            let c = c.clone();
            async move { c.mutate(options, async move { rx.await.unwrap() }).await }
        });
        tokio::task::yield_now().await;

        let outcome = c.cache().invalidate_guarded(&QueryKey::new("issues"));
        assert_eq!(outcome.deferred, vec![list_key()]);
        assert_eq!(store.get(&list_key()), Some(json!([{"id": "temp-7"}])));

        tx.send(Err(RemoteError::Transient("timeout".into()))).unwrap();
        assert!(task.await.unwrap().is_err());
        // Rolled back, then the deferred invalidation applied.
        assert_eq!(store.get(&list_key()), None);
    }

    #[tokio::test]
    async fn dropping_an_unsettled_mutation_rolls_it_back() {
        let c = coordinator();
        let store = c.cache().store().clone();
        store.put(list_key(), json!([]), Duration::from_secs(60));
        let options = MutationOptions::new("create-issue").patch(append_item(json!({"id": "temp-2"})));

        let fut = c.mutate::<Value, _>(options, std::future::pending());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(timed_out.is_err());
        assert_eq!(store.get(&list_key()), Some(json!([])));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_mutation_still_applies_deferred_invalidations() {
        let c = coordinator();
        let store = c.cache().store().clone();
        store.put(list_key(), json!([{"id": "pre"}]), Duration::from_secs(60));

        let options = MutationOptions::new("create-issue").patch(append_item(json!({"id": "temp-3"})));
        let task = tokio::spawn({
            let c = c.clone();
            async move { c.mutate::<Value, _>(options, std::future::pending()).await }
        });
        tokio::task::yield_now().await;

        // A realtime change lands while the patch is held.
        let outcome = c.cache().invalidate_guarded(&QueryKey::new("issues"));
        assert_eq!(outcome.deferred, vec![list_key()]);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(store.get(&list_key()), None);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn rollback_after_an_overlapping_commit_leaves_the_key_unowned() {
        let c = coordinator();
        let store = c.cache().store().clone();
        let detail = QueryKey::new("issues").with("detail").with("1");
        store.put(detail.clone(), json!({"status": "open"}), Duration::from_secs(60));

        let set_status = |status: &'static str| {
            MutationOptions::new("update-status")
                .patch(Patch::exact(detail.clone(), move |_, _| Some(json!({ "status": status }))))
        };
        let (tx_a, rx_a) = tokio::sync::oneshot::channel::<Result<Value, RemoteError>>();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel::<Result<Value, RemoteError>>();
        let a = tokio::spawn({
            let (c, options) = (c.clone(), set_status("in_progress"));
            async move { c.mutate(options, async move { rx_a.await.unwrap() }).await }
        });
        tokio::task::yield_now().await;
        let b = tokio::spawn({
            let (c, options) = (c.clone(), set_status("resolved"));
            async move { c.mutate(options, async move { rx_b.await.unwrap() }).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(c.pending_count(), 2);

        tx_a.send(Ok(json!({"status": "in_progress"}))).unwrap();
        a.await.unwrap().unwrap();
        tx_b.send(Err(RemoteError::client(409, "conflict"))).unwrap();
        assert!(b.await.unwrap().is_err());

        assert_eq!(c.pending_count(), 0);
        assert_eq!(store.entry(&detail).map(|e| e.owner), Some(None));
        let outcome = c.cache().invalidate_guarded(&detail);
        assert_eq!(outcome.removed, vec![detail.clone()]);
        assert!(outcome.deferred.is_empty());
        assert!(store.put_fetched(detail.clone(), json!({"status": "in_progress"}), Freshness::ttl(Duration::from_secs(60))));
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no wire form"))
        }
    }

    #[tokio::test]
    async fn unserializable_server_values_skip_the_reconcile() {
        let c = coordinator();
        let store = c.cache().store().clone();
        store.put(list_key(), json!([]), Duration::from_secs(60));

        let options = MutationOptions::new("create-issue")
            .patch(append_item(json!({"id": "temp-4"})))
            .reconcile(|_, _, _| Some(json!("reconciled against null")));
        c.mutate(options, async { Ok(Unencodable) }).await.unwrap();

        let entry = store.entry(&list_key()).unwrap();
        assert_eq!(entry.value, json!([{"id": "temp-4"}]));
        assert!(entry.owner.is_none());
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn temp_ids_are_prefixed_and_unique() {
        let a = temp_id();
        assert!(a.starts_with("temp-"));
        assert_ne!(a, temp_id());
    }
}
