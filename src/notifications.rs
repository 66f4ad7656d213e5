use crate::backend::{Filter, RemoteBackend};
use crate::cache::Patch;
use crate::clock::Clock;
use crate::error::{MutationError, QueryError, RemoteError};
use crate::keys;
use crate::models::{ChangeEvent, ChangeKind, NotificationRecord};
use crate::mutation::{MutationCoordinator, MutationOptions};
use crate::query::{fetcher, Loaded, QueryCacheManager};
use serde_json::{json, Value};
use std::sync::Arc;

const NOTIFICATIONS: &str = "notifications";

impl NotificationRecord {
    // A freshly pushed notification, if the event carries one.
    pub fn from_change_event(event: &ChangeEvent) -> Option<Self> {
        if event.event_type != ChangeKind::Insert || event.table != NOTIFICATIONS {
            return None;
        }
        serde_json::from_value(event.new.clone()?).ok()
    }
}

fn decode_rows(rows: Vec<Value>) -> Vec<NotificationRecord> {
    rows.into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect()
}

fn set_read(item: &Value, now_ms: i64) -> Option<Value> {
    let mut next = item.clone();
    let map = next.as_object_mut()?;
    map.insert("read".into(), Value::Bool(true));
    map.insert("read_at".into(), Value::from(now_ms));
    Some(next)
}

fn is_unread(item: &Value) -> bool {
    !item.get("read").and_then(Value::as_bool).unwrap_or(false)
}

fn decrement(count: Option<&Value>) -> Option<Value> {
    let n = count?.as_u64()?;
    Some(Value::from(n.saturating_sub(1)))
}

/// Per-user notification read model kept in step with the backend.
#[derive(Clone)]
pub struct NotificationService {
    backend: Arc<dyn RemoteBackend>,
    mutations: MutationCoordinator,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(backend: Arc<dyn RemoteBackend>, mutations: MutationCoordinator, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            mutations,
            clock,
        }
    }

    pub fn cache(&self) -> &QueryCacheManager {
        self.mutations.cache()
    }

    // Whether the cached list already knows the record as read.
    fn known_read(&self, user_id: &str, id: &str) -> bool {
        self.cache()
            .get_query_data(&keys::notifications::list(user_id))
            .and_then(|list| {
                list.as_array()?
                    .iter()
                    .find(|n| n["id"] == id)
                    .map(|n| !is_unread(n))
            })
            .unwrap_or(false)
    }

    /// Active notifications, newest first.
    pub async fn list(&self, user_id: &str) -> Result<Loaded<Vec<NotificationRecord>>, QueryError> {
        let backend = self.backend.clone();
        let owned = user_id.to_string();
        let fetch = fetcher(move || {
            let backend = backend.clone();
            let rows = Filter::new().eq("user_id", owned.clone());
            async move { Ok(Value::Array(backend.select(NOTIFICATIONS, &rows).await?.data)) }
        });
        let read = self
            .cache()
            .query(keys::notifications::list(user_id), fetch)
            .await?;
        let mut loaded: Loaded<Vec<Value>> = read.load()?;
        // Records expire while cached too.
        let now = self.clock.now_ms();
        let mut records = decode_rows(std::mem::take(&mut loaded.data));
        records.retain(|n| n.is_active(now));
        Ok(Loaded {
            data: records,
            stale: loaded.stale,
        })
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<Loaded<u64>, QueryError> {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let owned = user_id.to_string();
        let fetch = fetcher(move || {
            let backend = backend.clone();
            let clock = clock.clone();
            let rows = Filter::new().eq("user_id", owned.clone()).eq("read", false);
            async move {
                let unread = backend.select(NOTIFICATIONS, &rows).await?.data;
                let now = clock.now_ms();
                let active = decode_rows(unread).iter().filter(|n| n.is_active(now)).count();
                Ok(Value::from(active as u64))
            }
        });
        self.cache()
            .query(keys::notifications::unread_count(user_id), fetch)
            .await?
            .load()
    }

    pub async fn mark_read(&self, user_id: &str, id: &str) -> Result<NotificationRecord, MutationError> {
        let now = self.clock.now_ms();
        let list_key = keys::notifications::list(user_id);
        let reconciled_key = list_key.clone();
        let already_read = self.known_read(user_id, id);
        let target = id.to_string();
        let reconciled_id = id.to_string();

        let mut options = MutationOptions::new("mark-notification-read")
            .patch(Patch::exact(list_key, move |_, current| {
                let items = current?.as_array()?;
                Some(Value::Array(
                    items
                        .iter()
                        .map(|n| {
                            if n["id"] == target.as_str() {
                                set_read(n, now).unwrap_or_else(|| n.clone())
                            } else {
                                n.clone()
                            }
                        })
                        .collect(),
                ))
            }))
            .reconcile(move |key, current, server| {
                if *key != reconciled_key {
                    return None;
                }
                let items = current.as_array()?;
                Some(Value::Array(
                    items
                        .iter()
                        .map(|n| if n["id"] == reconciled_id.as_str() { server.clone() } else { n.clone() })
                        .collect(),
                ))
            })
            .invalidates(keys::notifications::unread_count(user_id));
        if !already_read {
            options = options.patch(Patch::exact(
                keys::notifications::unread_count(user_id),
                |_, current| decrement(current),
            ));
        }

        let backend = self.backend.clone();
        let (user_id, id) = (user_id.to_string(), id.to_string());
        let outcome = self
            .mutations
            .mutate(options, async move {
                owned_by(backend.as_ref(), &user_id, &id).await?;
                let updated = backend
                    .update(NOTIFICATIONS, &id, json!({ "read": true, "read_at": now }))
                    .await?;
                Ok::<NotificationRecord, RemoteError>(serde_json::from_value(updated)?)
            })
            .await?;
        Ok(outcome.value)
    }

    // Returns how many records were unread.
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64, MutationError> {
        let now = self.clock.now_ms();
        let options = MutationOptions::new("mark-all-notifications-read")
            .patch(Patch::exact(keys::notifications::list(user_id), move |_, current| {
                let items = current?.as_array()?;
                Some(Value::Array(
                    items
                        .iter()
                        .map(|n| {
                            if is_unread(n) {
                                set_read(n, now).unwrap_or_else(|| n.clone())
                            } else {
                                n.clone()
                            }
                        })
                        .collect(),
                ))
            }))
            .patch(Patch::exact(keys::notifications::unread_count(user_id), |_, current| {
                current.map(|_| Value::from(0))
            }))
            .invalidates(keys::notifications::unread_count(user_id));

        let backend = self.backend.clone();
        let rows = Filter::new().eq("user_id", user_id).eq("read", false);
        let outcome = self
            .mutations
            .mutate(options, async move {
                backend
                    .update_where(NOTIFICATIONS, &rows, json!({ "read": true, "read_at": now }))
                    .await
            })
            .await?;
        Ok(outcome.value)
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<NotificationRecord, MutationError> {
        let already_read = self.known_read(user_id, id);
        let target = id.to_string();
        let mut options = MutationOptions::new("delete-notification")
            .patch(Patch::exact(keys::notifications::list(user_id), move |_, current| {
                let items = current?.as_array()?;
                Some(Value::Array(
                    items
                        .iter()
                        .filter(|n| n["id"] != target.as_str())
                        .cloned()
                        .collect(),
                ))
            }))
            .invalidates(keys::notifications::unread_count(user_id));
        if !already_read {
            options = options.patch(Patch::exact(
                keys::notifications::unread_count(user_id),
                |_, current| decrement(current),
            ));
        }

        let backend = self.backend.clone();
        let (user_id, id) = (user_id.to_string(), id.to_string());
        let outcome = self
            .mutations
            .mutate(options, async move {
                owned_by(backend.as_ref(), &user_id, &id).await?;
                let removed = backend.delete(NOTIFICATIONS, &id).await?;
                Ok::<NotificationRecord, RemoteError>(serde_json::from_value(removed)?)
            })
            .await?;
        Ok(outcome.value)
    }

    // A pushed insert for `user_id` that is still worth showing.
    pub fn incoming(&self, user_id: &str, event: &ChangeEvent) -> Option<NotificationRecord> {
        NotificationRecord::from_change_event(event)
            .filter(|n| n.user_id == user_id && n.is_active(self.clock.now_ms()))
    }
}

// Someone else's record reads as missing.
async fn owned_by(backend: &dyn RemoteBackend, user_id: &str, id: &str) -> Result<(), RemoteError> {
    let row = backend.get(NOTIFICATIONS, id).await?;
    if row.get("user_id").and_then(Value::as_str) != Some(user_id) {
        return Err(RemoteError::not_found(format!("notification {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;
    use crate::config::QueryPolicy;
    use crate::database::init_database;
    use crate::models::NotificationType;
    use tokio::sync::broadcast;

    async fn setup() -> (NotificationService, SqliteBackend, Arc<ManualClock>) {
        let pool = init_database(":memory:").await.unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let (tx, _) = broadcast::channel(64);
        let backend = SqliteBackend::new(pool, tx, clock.clone());
        let cache = QueryCacheManager::new(CacheStore::new(), QueryPolicy::default());
        let service = NotificationService::new(
            Arc::new(backend.clone()),
            MutationCoordinator::new(cache),
            clock.clone(),
        );
        (service, backend, clock)
    }

    async fn seed(backend: &SqliteBackend, id: &str, user: &str, created_at: i64, extra: Value) {
        let mut row = json!({
            "id": id,
            "user_id": user,
            "type": "comment",
            "title": format!("Notification {id}"),
            "created_at": created_at,
        });
        if let (Some(row), Value::Object(extra)) = (row.as_object_mut(), extra) {
            row.extend(extra);
        }
        backend.insert(NOTIFICATIONS, row).await.unwrap();
    }

    #[tokio::test]
    async fn list_hides_expired_records_newest_first() {
        let (service, backend, clock) = setup().await;
        seed(&backend, "n1", "u1", 1, json!({})).await;
        seed(&backend, "n2", "u1", 3, json!({ "expires_at": 20_000 })).await;
        seed(&backend, "n3", "u1", 2, json!({ "expires_at": 5_000 })).await;
        seed(&backend, "other", "u2", 4, json!({})).await;

        let ids: Vec<String> = service.list("u1").await.unwrap().data.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n2", "n1"]);

        // Expiry applies to the cached copy as well.
        clock.advance_ms(10_000);
        let ids: Vec<String> = service.list("u1").await.unwrap().data.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n1"]);
        // Still stored until purged.
        assert!(backend.get(NOTIFICATIONS, "n2").await.is_ok());
    }

    #[tokio::test]
    async fn mark_read_updates_list_and_count() {
        let (service, backend, _) = setup().await;
        seed(&backend, "n1", "u1", 1, json!({})).await;
        seed(&backend, "n2", "u1", 2, json!({})).await;
        service.list("u1").await.unwrap();
        assert_eq!(service.unread_count("u1").await.unwrap().data, 2);

        let record = service.mark_read("u1", "n1").await.unwrap();
        assert!(record.read);
        assert_eq!(record.read_at, Some(10_000));

        let list = service.list("u1").await.unwrap().data;
        assert!(list.iter().find(|n| n.id == "n1").unwrap().read);
        assert_eq!(service.unread_count("u1").await.unwrap().data, 1);
    }

    #[tokio::test]
    async fn mark_all_read_zeroes_the_count() {
        let (service, backend, _) = setup().await;
        for (i, id) in ["n1", "n2", "n3"].iter().enumerate() {
            seed(&backend, id, "u1", i as i64, json!({})).await;
        }
        seed(&backend, "mine", "u2", 9, json!({})).await;
        service.list("u1").await.unwrap();

        assert_eq!(service.mark_all_read("u1").await.unwrap(), 3);
        assert!(service.list("u1").await.unwrap().data.iter().all(|n| n.read));
        assert_eq!(service.unread_count("u1").await.unwrap().data, 0);
        assert_eq!(service.unread_count("u2").await.unwrap().data, 1);
    }

    #[tokio::test]
    async fn deleting_someone_elses_notification_rolls_back() {
        let (service, backend, _) = setup().await;
        seed(&backend, "theirs", "u2", 1, json!({})).await;
        seed(&backend, "n1", "u1", 2, json!({})).await;
        let before = service.list("u1").await.unwrap().data;

        let err = service.delete("u1", "theirs").await.unwrap_err();
        assert_eq!(err.remote().status(), 404);
        assert_eq!(service.list("u1").await.unwrap().data, before);

        let removed = service.delete("u1", "n1").await.unwrap();
        assert_eq!(removed.id, "n1");
        assert!(service.list("u1").await.unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn pushed_inserts_become_records() {
        let (service, _, _) = setup().await;
        let event = ChangeEvent {
            event_type: ChangeKind::Insert,
            table: NOTIFICATIONS.into(),
            new: Some(json!({
                "id": "n9",
                "user_id": "u1",
                "type": "verification_approved",
                "title": "Verified",
                "priority": "high",
                "created_at": 5,
            })),
            old: None,
        };
        let record = service.incoming("u1", &event).unwrap();
        assert_eq!(record.kind, NotificationType::VerificationApproved);
        assert!(service.incoming("u2", &event).is_none());

        let update = ChangeEvent {
            event_type: ChangeKind::Update,
            ..event
        };
        assert!(NotificationRecord::from_change_event(&update).is_none());
    }
}
