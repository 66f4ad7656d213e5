use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use civic_sync::app_state::AppState;
use civic_sync::backend::SqliteBackend;
use civic_sync::clock::{Clock, SystemClock};
use civic_sync::config::Config;
use civic_sync::database::init_database;
use civic_sync::handlers::{
    add_comment, check_rate_limit, create_issue, delete_notification, get_issue, health_check,
    issue_stats, list_comments, list_issues, list_notifications, mark_all_notifications_read,
    mark_notification_read, record_attempt, unread_count, update_issue_status,
};
use civic_sync::maintenance::spawn_purge_worker;
use civic_sync::realtime::RealtimeSignal;
use civic_sync::websocket::ws_handler;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    info!("Initializing database...");
    let pool = init_database(&config.database_file).await?;

    let (event_tx, _) = broadcast::channel(1000);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = SqliteBackend::new(pool, event_tx, clock.clone());

    let state = AppState::new(&config, backend.clone(), clock.clone());

    // Held for the life of the process.
    let _watches = state.watch_backend();

    let mut signals = state.realtime.signals();
    tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            match signal {
                RealtimeSignal::Degraded { family, reason, .. } => {
                    error!("Realtime {} degraded: {}", family, reason);
                }
                RealtimeSignal::Resynced { family } => {
                    info!("Realtime {} resynced", family);
                }
            }
        }
    });

    spawn_purge_worker(state.rate_limiter.clone(), backend, clock, config.purge_interval);

    let app = Router::new()
        .route("/issues", get(list_issues).post(create_issue))
        .route("/issues/stats", get(issue_stats))
        .route("/issues/{id}", get(get_issue))
        .route("/issues/{id}/status", patch(update_issue_status))
        .route("/issues/{id}/comments", get(list_comments).post(add_comment))
        .route("/users/{user_id}/notifications", get(list_notifications))
        .route("/users/{user_id}/notifications/unread-count", get(unread_count))
        .route("/users/{user_id}/notifications/read-all", post(mark_all_notifications_read))
        .route("/users/{user_id}/notifications/{id}/read", post(mark_notification_read))
        .route("/users/{user_id}/notifications/{id}", delete(delete_notification))
        .route("/rate-limit/check", post(check_rate_limit))
        .route("/rate-limit/record", post(record_attempt))
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_addr.parse()?;
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
