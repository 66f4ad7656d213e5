use crate::config::ReconnectPolicy;
use crate::error::TransportError;
use crate::keys::{self, QueryKey};
use crate::models::ChangeEvent;
use crate::query::QueryCacheManager;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// Backend entity type whose rows and cache keys move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    Issues,
    Comments,
    Solutions,
    Notifications,
    Profiles,
}

impl ResourceFamily {
    pub const ALL: [ResourceFamily; 5] = [
        ResourceFamily::Issues,
        ResourceFamily::Comments,
        ResourceFamily::Solutions,
        ResourceFamily::Notifications,
        ResourceFamily::Profiles,
    ];

    pub fn table(self) -> &'static str {
        match self {
            ResourceFamily::Issues => "issues",
            ResourceFamily::Comments => "comments",
            ResourceFamily::Solutions => "solutions",
            ResourceFamily::Notifications => "notifications",
            ResourceFamily::Profiles => "profiles",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.table() == table)
    }

    // Everything this family may have cached; used to resync after missed events.
    pub fn cache_prefixes(self) -> Vec<QueryKey> {
        match self {
            ResourceFamily::Issues | ResourceFamily::Comments | ResourceFamily::Solutions => {
                vec![keys::issues::all()]
            }
            ResourceFamily::Notifications => vec![keys::notifications::all()],
            ResourceFamily::Profiles => vec![keys::profiles::all()],
        }
    }

    /// Cache prefixes whose data could include the changed record. Falls back to
    /// the whole family when the record lacks the identifying field.
    pub fn affected_keys(self, event: &ChangeEvent) -> Vec<QueryKey> {
        match self {
            ResourceFamily::Issues => match event.field_str("id") {
                Some(id) => vec![
                    keys::issues::detail(id),
                    keys::issues::lists(),
                    keys::issues::stats(),
                ],
                None => self.cache_prefixes(),
            },
            ResourceFamily::Comments => match event.field_str("issue_id") {
                Some(issue_id) => vec![keys::issues::detail(issue_id), keys::issues::lists()],
                None => self.cache_prefixes(),
            },
            ResourceFamily::Solutions => match event.field_str("issue_id") {
                Some(issue_id) => vec![
                    keys::issues::detail(issue_id),
                    keys::issues::lists(),
                    keys::issues::stats(),
                ],
                None => self.cache_prefixes(),
            },
            ResourceFamily::Notifications => match event.field_str("user_id") {
                Some(user_id) => vec![keys::notifications::for_user(user_id)],
                None => self.cache_prefixes(),
            },
            ResourceFamily::Profiles => match event.field_str("id") {
                Some(id) => vec![keys::profiles::detail(id)],
                None => self.cache_prefixes(),
            },
        }
    }
}

impl fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for ResourceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table(s).ok_or_else(|| format!("unknown resource family '{s}'"))
    }
}

// Row predicate scoping a channel, e.g. a single user or a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelFilter {
    #[default]
    All,
    Eq {
        column: String,
        value: String,
    },
    Since {
        column: String,
        after_ms: i64,
    },
}

impl ChannelFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        ChannelFilter::Eq {
            column: "user_id".to_string(),
            value: user_id.into(),
        }
    }

    // Updates match when either side of the change matches, so rows leaving the
    // filtered set still reach the channel.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let rows = [event.new.as_ref(), event.old.as_ref()];
        match self {
            ChannelFilter::All => true,
            ChannelFilter::Eq { column, value } => rows.iter().flatten().any(|row| {
                match row.get(column) {
                    Some(serde_json::Value::String(s)) => s == value,
                    Some(other) => other.to_string() == *value,
                    None => false,
                }
            }),
            ChannelFilter::Since { column, after_ms } => rows
                .iter()
                .flatten()
                .any(|row| row.get(column).and_then(|v| v.as_i64()).is_some_and(|t| t > *after_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    // Retrying after `attempt` consecutive failures.
    Error { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    TransportFailed,
    RetriesExhausted,
    Unsubscribed,
}

impl ConnectionState {
    pub fn next(self, event: ChannelEvent) -> ConnectionState {
        use ChannelEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (Closed, _) => Closed,
            (_, Unsubscribed) | (_, RetriesExhausted) => Closed,
            (Connecting, Connected) | (Error { .. }, Connected) => Open,
            (Open, Connected) => Open,
            (Connecting, TransportFailed) | (Open, TransportFailed) => Error { attempt: 1 },
            (Error { attempt }, TransportFailed) => Error {
                attempt: attempt + 1,
            },
        }
    }
}

// Signals for the owner of the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RealtimeSignal {
    // Reconnects ran out; the channel delivers nothing until resubscribed.
    Degraded {
        family: ResourceFamily,
        filter: ChannelFilter,
        reason: String,
    },
    Resynced {
        family: ResourceFamily,
    },
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, TransportError>>;

/// Source of row change events for one resource family.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn connect(&self, family: ResourceFamily) -> Result<ChangeStream, TransportError>;
}

// Change feed fed by an in-process broadcast channel.
#[derive(Clone)]
pub struct BroadcastFeed {
    tx: broadcast::Sender<Arc<ChangeEvent>>,
}

impl BroadcastFeed {
    pub fn new(tx: broadcast::Sender<Arc<ChangeEvent>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChangeFeed for BroadcastFeed {
    async fn connect(&self, family: ResourceFamily) -> Result<ChangeStream, TransportError> {
        let rx = self.tx.subscribe();
        let table = family.table();
        let events = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event.as_ref().clone()), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(TransportError::Lagged(n)), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter(move |item| {
            let keep = match item {
                Ok(event) => event.table == table,
                Err(_) => true,
            };
            std::future::ready(keep)
        });
        Ok(events.boxed())
    }
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type ChannelKey = (ResourceFamily, ChannelFilter);

struct Consumer {
    active: Arc<AtomicBool>,
    handler: ChangeHandler,
}

struct ChannelSlot {
    consumers: Arc<Mutex<HashMap<u64, Consumer>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    cache: QueryCacheManager,
    feed: Arc<dyn ChangeFeed>,
    policy: ReconnectPolicy,
    channels: Mutex<HashMap<ChannelKey, ChannelSlot>>,
    signals: broadcast::Sender<RealtimeSignal>,
    next_consumer: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One logical channel per (family, filter), shared by reference count between
/// consumers. Each change event invalidates the cache prefixes it could affect,
/// then reaches the consumers' handlers.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(cache: QueryCacheManager, feed: Arc<dyn ChangeFeed>, policy: ReconnectPolicy) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                feed,
                policy,
                channels: Mutex::new(HashMap::new()),
                signals,
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    pub fn signals(&self) -> broadcast::Receiver<RealtimeSignal> {
        self.inner.signals.subscribe()
    }

    pub fn subscribe<F>(&self, family: ResourceFamily, filter: ChannelFilter, on_change: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let key: ChannelKey = (family, filter);
        let consumer_id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let mut channels = lock(&self.inner.channels);
        let slot = channels.entry(key.clone()).or_insert_with(|| {
            let consumers = Arc::new(Mutex::new(HashMap::new()));
            let (state, _) = watch::channel(ConnectionState::Connecting);
            let state = Arc::new(state);
            let task = spawn_channel(self.inner.clone(), key.clone(), consumers.clone(), state.clone());
            info!(family = %key.0, filter = ?key.1, "realtime channel opened");
            ChannelSlot {
                consumers,
                state,
                task,
            }
        });
        // A channel that gave up is restarted by the next interested consumer.
        if slot.task.is_finished() {
            info!(family = %key.0, filter = ?key.1, "realtime channel restarted");
            slot.state.send_replace(ConnectionState::Connecting);
            slot.task = spawn_channel(
                self.inner.clone(),
                key.clone(),
                slot.consumers.clone(),
                slot.state.clone(),
            );
        }
        lock(&slot.consumers).insert(
            consumer_id,
            Consumer {
                active: active.clone(),
                handler: Arc::new(on_change),
            },
        );
        let state = slot.state.subscribe();
        drop(channels);

        Subscription {
            inner: self.inner.clone(),
            key,
            consumer_id,
            active,
            state,
        }
    }

    pub fn channel_state(&self, family: ResourceFamily, filter: &ChannelFilter) -> Option<ConnectionState> {
        lock(&self.inner.channels)
            .get(&(family, filter.clone()))
            .map(|slot| *slot.state.borrow())
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    // Closes every channel regardless of consumers.
    pub fn shutdown(&self) {
        let drained: Vec<ChannelSlot> = lock(&self.inner.channels).drain().map(|(_, s)| s).collect();
        for slot in drained {
            slot.task.abort();
            for consumer in lock(&slot.consumers).values() {
                consumer.active.store(false, Ordering::SeqCst);
            }
            slot.state.send_replace(ConnectionState::Closed);
        }
    }
}

/// Handle returned by [`SubscriptionManager::subscribe`]. Unsubscribing is
/// idempotent and also happens on drop.
pub struct Subscription {
    inner: Arc<ManagerInner>,
    key: ChannelKey,
    consumer_id: u64,
    active: Arc<AtomicBool>,
    state: watch::Receiver<ConnectionState>,
}

impl Subscription {
    pub fn family(&self) -> ResourceFamily {
        self.key.0
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut channels = lock(&self.inner.channels);
        let Some(slot) = channels.get(&self.key) else {
            return;
        };
        let now_empty = {
            let mut consumers = lock(&slot.consumers);
            consumers.remove(&self.consumer_id);
            consumers.is_empty()
        };
        if now_empty {
            if let Some(slot) = channels.remove(&self.key) {
                slot.task.abort();
                let closed = slot.state.borrow().next(ChannelEvent::Unsubscribed);
                slot.state.send_replace(closed);
                info!(family = %self.key.0, filter = ?self.key.1, "realtime channel closed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn spawn_channel(
    inner: Arc<ManagerInner>,
    key: ChannelKey,
    consumers: Arc<Mutex<HashMap<u64, Consumer>>>,
    state: Arc<watch::Sender<ConnectionState>>,
) -> JoinHandle<()> {
    tokio::spawn(run_channel(inner, key, consumers, state))
}

fn transition(state: &watch::Sender<ConnectionState>, key: &ChannelKey, event: ChannelEvent) -> ConnectionState {
    let from = *state.borrow();
    let to = from.next(event);
    if from != to {
        match to {
            ConnectionState::Error { attempt } => {
                warn!(family = %key.0, attempt, "realtime channel error, retrying")
            }
            _ => info!(family = %key.0, ?from, ?to, "realtime channel state"),
        }
    }
    state.send_replace(to);
    to
}

fn resync(inner: &ManagerInner, family: ResourceFamily) {
    for prefix in family.cache_prefixes() {
        inner.cache.invalidate_guarded(&prefix);
    }
    let _ = inner.signals.send(RealtimeSignal::Resynced { family });
}

fn deliver(
    inner: &ManagerInner,
    key: &ChannelKey,
    consumers: &Mutex<HashMap<u64, Consumer>>,
    event: &ChangeEvent,
) {
    let (family, filter) = key;
    if event.table != family.table() || !filter.matches(event) {
        return;
    }
    for prefix in family.affected_keys(event) {
        let outcome = inner.cache.invalidate_guarded(&prefix);
        debug!(
            %prefix,
            removed = outcome.removed.len(),
            deferred = outcome.deferred.len(),
            "realtime invalidation"
        );
    }
    let handlers: Vec<(Arc<AtomicBool>, ChangeHandler)> = lock(consumers)
        .values()
        .map(|c| (c.active.clone(), c.handler.clone()))
        .collect();
    for (active, handler) in handlers {
        if active.load(Ordering::SeqCst) {
            handler(event);
        }
    }
}

async fn run_channel(
    inner: Arc<ManagerInner>,
    key: ChannelKey,
    consumers: Arc<Mutex<HashMap<u64, Consumer>>>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let family = key.0;
    let mut failures: u32 = 0;
    let mut last_error = String::new();

    loop {
        match inner.feed.connect(family).await {
            Ok(mut events) => {
                transition(&state, &key, ChannelEvent::Connected);
                if failures > 0 {
                    // Events may have been missed while disconnected.
                    resync(&inner, family);
                }
                failures = 0;

                loop {
                    match events.next().await {
                        Some(Ok(event)) => deliver(&inner, &key, &consumers, &event),
                        Some(Err(TransportError::Lagged(n))) => {
                            warn!(family = %family, lost = n, "realtime channel lagged, resyncing");
                            resync(&inner, family);
                        }
                        Some(Err(e)) => {
                            last_error = e.to_string();
                            break;
                        }
                        None => {
                            last_error = "change stream ended".to_string();
                            break;
                        }
                    }
                }
            }
            Err(e) => last_error = e.to_string(),
        }

        transition(&state, &key, ChannelEvent::TransportFailed);
        failures += 1;
        if failures > inner.policy.max_attempts {
            transition(&state, &key, ChannelEvent::RetriesExhausted);
            error!(family = %family, filter = ?key.1, error = %last_error, "realtime channel degraded");
            let _ = inner.signals.send(RealtimeSignal::Degraded {
                family,
                filter: key.1.clone(),
                reason: last_error,
            });
            return;
        }
        tokio::time::sleep(inner.policy.backoff.delay(failures - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::QueryPolicy;
    use crate::models::ChangeKind;
    use crate::retry::Backoff;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn issue_event(id: &str) -> ChangeEvent {
        ChangeEvent {
            event_type: ChangeKind::Update,
            table: "issues".into(),
            new: Some(json!({"id": id, "status": "resolved"})),
            old: Some(json!({"id": id, "status": "open"})),
        }
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            backoff: Backoff {
                base_ms: 100,
                cap_ms: 1_000,
            },
        }
    }

    fn cache() -> QueryCacheManager {
        QueryCacheManager::new(CacheStore::new(), QueryPolicy::default())
    }

    type Script = Result<Vec<Result<ChangeEvent, TransportError>>, TransportError>;

    // Replays one script per connect; runs dry into connect failures.
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Script>>,
        connects: AtomicU32,
    }

    impl ScriptedFeed {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn connect(&self, _family: ResourceFamily) -> Result<ChangeStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = lock(&self.scripts).pop_front();
            match next {
                Some(Ok(events)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Connect("refused".into())),
            }
        }
    }

    #[test]
    fn state_machine_transitions() {
        use ChannelEvent::*;
        use ConnectionState::*;
        assert_eq!(Connecting.next(Connected), Open);
        assert_eq!(Open.next(TransportFailed), Error { attempt: 1 });
        assert_eq!(Error { attempt: 1 }.next(TransportFailed), Error { attempt: 2 });
        assert_eq!(Error { attempt: 2 }.next(Connected), Open);
        assert_eq!(Error { attempt: 5 }.next(RetriesExhausted), Closed);
        assert_eq!(Open.next(Unsubscribed), Closed);
        assert_eq!(Closed.next(Connected), Closed);
    }

    #[test]
    fn filters_match_either_side_of_an_update() {
        let event = ChangeEvent {
            event_type: ChangeKind::Update,
            table: "notifications".into(),
            new: Some(json!({"user_id": "u2", "created_at": 50})),
            old: Some(json!({"user_id": "u1", "created_at": 50})),
        };
        assert!(ChannelFilter::All.matches(&event));
        assert!(ChannelFilter::user("u1").matches(&event));
        assert!(ChannelFilter::user("u2").matches(&event));
        assert!(!ChannelFilter::user("u3").matches(&event));
        let since = |after_ms| ChannelFilter::Since {
            column: "created_at".into(),
            after_ms,
        };
        assert!(since(10).matches(&event));
        assert!(!since(50).matches(&event));
    }

    #[test]
    fn issue_changes_hit_detail_lists_and_stats() {
        let affected = ResourceFamily::Issues.affected_keys(&issue_event("42"));
        assert_eq!(
            affected,
            vec![keys::issues::detail("42"), keys::issues::lists(), keys::issues::stats()]
        );
        let anonymous = ChangeEvent {
            event_type: ChangeKind::Delete,
            table: "comments".into(),
            new: None,
            old: None,
        };
        assert_eq!(
            ResourceFamily::Comments.affected_keys(&anonymous),
            vec![keys::issues::all()]
        );
    }

    #[tokio::test]
    async fn events_invalidate_the_cache_then_reach_handlers() {
        let (tx, _) = broadcast::channel(16);
        let cache = cache();
        let manager = SubscriptionManager::new(cache.clone(), Arc::new(BroadcastFeed::new(tx.clone())), policy(3));
        cache.store().put(keys::issues::detail("42"), json!({"id": "42"}), Duration::from_secs(60));
        cache.store().put(keys::notifications::list("u1"), json!([]), Duration::from_secs(60));

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = manager.subscribe(ResourceFamily::Issues, ChannelFilter::All, move |e| {
            let _ = seen_tx.send(e.clone());
        });
        let mut state = sub.state_changes();
        state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();

        tx.send(Arc::new(issue_event("42"))).unwrap();
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen, issue_event("42"));
        assert_eq!(cache.get_query_data(&keys::issues::detail("42")), None);
        assert!(cache.get_query_data(&keys::notifications::list("u1")).is_some());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_reference_counted() {
        let (tx, _) = broadcast::channel(16);
        let manager = SubscriptionManager::new(cache(), Arc::new(BroadcastFeed::new(tx.clone())), policy(3));
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        let first = manager.subscribe(ResourceFamily::Issues, ChannelFilter::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let second = manager.subscribe(ResourceFamily::Issues, ChannelFilter::All, move |_| {
            let _ = seen_tx.send(());
        });
        assert_eq!(manager.channel_count(), 1);
        second.state_changes().wait_for(|s| *s == ConnectionState::Open).await.unwrap();

        first.unsubscribe();
        first.unsubscribe();
        assert!(!first.is_active());
        assert_eq!(manager.channel_count(), 1, "second consumer keeps the channel");

        tx.send(Arc::new(issue_event("1"))).unwrap();
        seen_rx.recv().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        second.unsubscribe();
        drop(second);
        assert_eq!(manager.channel_count(), 0);
        assert_eq!(manager.channel_state(ResourceFamily::Issues, &ChannelFilter::All), None);
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_signal_degraded_mode() {
        let feed = ScriptedFeed::new(vec![]);
        let manager = SubscriptionManager::new(cache(), feed.clone(), policy(3));
        let mut signals = manager.signals();

        let sub = manager.subscribe(ResourceFamily::Notifications, ChannelFilter::user("u1"), |_| {});
        let signal = signals.recv().await.unwrap();
        assert_eq!(
            signal,
            RealtimeSignal::Degraded {
                family: ResourceFamily::Notifications,
                filter: ChannelFilter::user("u1"),
                reason: "change feed connect failed: refused".into(),
            }
        );
        // First connect plus three retries.
        assert_eq!(feed.connects.load(Ordering::SeqCst), 4);
        assert_eq!(sub.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_streams_reconnect_and_resync() {
        let feed = ScriptedFeed::new(vec![
            Ok(vec![Err(TransportError::Stream("reset".into()))]),
            Err(TransportError::Connect("refused".into())),
            Ok(vec![]),
        ]);
        let cache = cache();
        let manager = SubscriptionManager::new(cache.clone(), feed.clone(), policy(5));
        let mut signals = manager.signals();
        cache.store().put(keys::issues::stats(), json!({}), Duration::from_secs(600));

        let sub = manager.subscribe(ResourceFamily::Issues, ChannelFilter::All, |_| {});
        assert_eq!(signals.recv().await.unwrap(), RealtimeSignal::Resynced { family: ResourceFamily::Issues });
        assert_eq!(sub.state(), ConnectionState::Open);
        assert_eq!(feed.connects.load(Ordering::SeqCst), 3);
        assert_eq!(cache.get_query_data(&keys::issues::stats()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_channels_restart_on_next_subscribe() {
        let feed = ScriptedFeed::new(vec![]);
        let manager = SubscriptionManager::new(cache(), feed.clone(), policy(0));
        let mut signals = manager.signals();
        let first = manager.subscribe(ResourceFamily::Profiles, ChannelFilter::All, |_| {});
        signals.recv().await.unwrap();
        tokio::task::yield_now().await;

        let _second = manager.subscribe(ResourceFamily::Profiles, ChannelFilter::All, |_| {});
        signals.recv().await.unwrap();
        assert_eq!(feed.connects.load(Ordering::SeqCst), 2);
        drop(first);
    }
}
