use civic_sync::app_state::AppState;
use civic_sync::backend::{RemoteBackend, SqliteBackend};
use civic_sync::clock::ManualClock;
use civic_sync::config::Config;
use civic_sync::database::init_database;
use civic_sync::keys;
use civic_sync::models::{CreateIssueRequest, IssueFilter, NotificationRecord};
use civic_sync::realtime::{ChannelFilter, ConnectionState, ResourceFamily, Subscription};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

async fn app() -> AppState {
    let pool = init_database(":memory:").await.unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let (tx, _) = broadcast::channel(256);
    let backend = SqliteBackend::new(pool, tx, clock.clone());
    AppState::new(&Config::default(), backend, clock)
}

async fn wait_open(subscription: &Subscription) {
    let mut states = subscription.state_changes();
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == ConnectionState::Open),
    )
    .await
    .unwrap()
    .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn out_of_band_writes_invalidate_cached_reads() {
    let app = app().await;
    let watches = app.watch_backend();
    for watch in &watches {
        wait_open(watch).await;
    }

    let filter = IssueFilter::default();
    assert_eq!(app.issues.list(&filter).await.unwrap().data.total, 0);
    let key = keys::issues::list(&filter);
    assert!(app.issues.cache().get_query_data(&key).is_some());

    // Another client writes straight to the backend.
    app.backend
        .insert(
            "issues",
            json!({
                "title": "Graffiti",
                "description": "",
                "category": "vandalism",
                "status": "open",
                "reporter_id": "u9",
            }),
        )
        .await
        .unwrap();

    let cache = app.issues.cache().clone();
    eventually(|| cache.get_query_data(&key).is_none()).await;
    assert_eq!(app.issues.list(&filter).await.unwrap().data.total, 1);
}

#[tokio::test]
async fn optimistic_create_converges_with_the_realtime_echo() {
    let app = app().await;
    let watches = app.watch_backend();
    for watch in &watches {
        wait_open(watch).await;
    }
    let filter = IssueFilter::default();
    app.issues.list(&filter).await.unwrap();

    let created = app
        .issues
        .create(CreateIssueRequest {
            title: "Flooded underpass".into(),
            description: "Knee deep".into(),
            category: "drainage".into(),
            reporter_id: "u1".into(),
            location: None,
        })
        .await
        .unwrap();

    // Give the echo of our own insert time to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let page = app.issues.list(&filter).await.unwrap().data;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, created.id);
    let cached = app.issues.cache().get_query_data(&keys::issues::list(&filter)).unwrap();
    assert!(!cached.to_string().contains("temp-"));
}

#[tokio::test]
async fn notification_channel_delivers_only_the_users_rows() {
    let app = app().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifications = app.notifications.clone();
    let subscription = app.realtime.subscribe(
        ResourceFamily::Notifications,
        ChannelFilter::user("u1"),
        move |event| {
            if let Some(record) = notifications.incoming("u1", event) {
                let _ = tx.send(record);
            }
        },
    );
    wait_open(&subscription).await;

    for (id, user) in [("n1", "u2"), ("n2", "u1")] {
        app.backend
            .insert(
                "notifications",
                json!({ "id": id, "user_id": user, "type": "system", "title": "Maintenance" }),
            )
            .await
            .unwrap();
    }

    let record: NotificationRecord = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.id, "n2");
    assert!(rx.try_recv().is_err());

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert_eq!(app.realtime.channel_count(), 0);
}

#[tokio::test]
async fn channels_are_shared_and_closed_by_the_last_consumer() {
    let app = app().await;
    let a = app.realtime.subscribe(ResourceFamily::Issues, ChannelFilter::All, |_| {});
    let b = app.realtime.subscribe(ResourceFamily::Issues, ChannelFilter::All, |_| {});
    assert_eq!(app.realtime.channel_count(), 1);

    drop(a);
    assert_eq!(app.realtime.channel_count(), 1);
    assert!(b.is_active());
    b.unsubscribe();
    assert_eq!(app.realtime.channel_count(), 0);
    assert_eq!(b.state(), ConnectionState::Closed);
}
