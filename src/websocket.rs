use crate::app_state::AppState;
use crate::models::{BroadcastEvent, NotificationRecord, SubscribeMessage};
use crate::realtime::{ChannelFilter, ResourceFamily, Subscription};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, PartialEq)]
enum ClientCommand {
    Subscribe(ResourceFamily, ChannelFilter),
    Unsubscribe(ResourceFamily),
}

fn parse_command(text: &str) -> Result<Option<ClientCommand>, String> {
    let parsed: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let Some(event_type) = parsed.get("event").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    match event_type {
        "subscribe" | "unsubscribe" => {
            let msg = serde_json::from_value::<SubscribeMessage>(parsed.clone()).map_err(|e| e.to_string())?;
            let family = msg.family.parse::<ResourceFamily>()?;
            if event_type == "subscribe" {
                Ok(Some(ClientCommand::Subscribe(family, msg.filter.unwrap_or_default())))
            } else {
                Ok(Some(ClientCommand::Unsubscribe(family)))
            }
        }
        _ => Ok(None),
    }
}

fn frame(event_type: &str, data: &impl Serialize) -> Option<String> {
    let data = serde_json::to_value(data).ok()?;
    serde_json::to_string(&BroadcastEvent {
        event_type: event_type.to_string(),
        data,
    })
    .ok()
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, state: AppState) {
    let sid = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<String>();

    // Degraded-mode and resync signals go to every client.
    let mut signal_rx = state.realtime.signals();
    let signal_tx = internal_tx.clone();
    let signal_task = tokio::spawn(async move {
        loop {
            match signal_rx.recv().await {
                Ok(signal) => {
                    if let Some(msg) = frame("realtime_signal", &signal) {
                        if signal_tx.send(msg).is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Realtime signals lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = internal_rx.recv().await {
            if ws_sender
                .send(axum::extract::ws::Message::Text(msg.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut subscriptions: Vec<Subscription> = Vec::new();

    while let Some(msg) = ws_receiver.next().await {
        let msg = if let Ok(msg) = msg {
            msg
        } else {
            break;
        };

        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        match parse_command(&text) {
            Ok(Some(ClientCommand::Subscribe(family, filter))) => {
                info!("Subscribing SID {} to {} ({:?})", sid, family, filter);
                let tx = internal_tx.clone();
                let subscription = state.realtime.subscribe(family, filter.clone(), move |event| {
                    let msg = match NotificationRecord::from_change_event(event) {
                        Some(record) => frame("notification", &record),
                        None => frame("change", event),
                    };
                    if let Some(msg) = msg {
                        let _ = tx.send(msg);
                    }
                });
                let ack = serde_json::json!({
                    "family": family,
                    "filter": filter,
                    "state": subscription.state(),
                });
                if let Some(msg) = frame("subscribed", &ack) {
                    let _ = internal_tx.send(msg);
                }
                subscriptions.push(subscription);
            }
            Ok(Some(ClientCommand::Unsubscribe(family))) => {
                subscriptions.retain(|s| {
                    if s.family() == family {
                        s.unsubscribe();
                        false
                    } else {
                        true
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Bad message from SID {}: {}", sid, e);
                if let Some(msg) = frame("error", &serde_json::json!({ "message": e })) {
                    let _ = internal_tx.send(msg);
                }
            }
        }
    }

    info!("Client disconnecting (SID: {})", sid);
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    signal_task.abort();
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_messages_carry_family_and_filter() {
        let cmd = parse_command(
            r#"{"event":"subscribe","family":"notifications","filter":{"kind":"eq","column":"user_id","value":"u1"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Some(ClientCommand::Subscribe(ResourceFamily::Notifications, ChannelFilter::user("u1")))
        );

        let cmd = parse_command(r#"{"event":"subscribe","family":"issues"}"#).unwrap();
        assert_eq!(cmd, Some(ClientCommand::Subscribe(ResourceFamily::Issues, ChannelFilter::All)));
    }

    #[test]
    fn unknown_families_and_garbage_are_errors() {
        assert!(parse_command(r#"{"event":"subscribe","family":"votes"}"#).is_err());
        assert!(parse_command("not json").is_err());
        assert_eq!(parse_command(r#"{"event":"ping"}"#), Ok(None));
        assert_eq!(
            parse_command(r#"{"event":"unsubscribe","family":"comments"}"#),
            Ok(Some(ClientCommand::Unsubscribe(ResourceFamily::Comments)))
        );
    }

    #[test]
    fn frames_wrap_payloads() {
        let msg = frame("change", &serde_json::json!({"id": 1})).unwrap();
        assert_eq!(msg, r#"{"event_type":"change","data":{"id":1}}"#);
    }
}
