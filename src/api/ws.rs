use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

use super::AppState;
use crate::events::TrackingEvent;

/// Client subscription message
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Subscribe to event topics. Exact topics (`location:bus-1`) or
    /// a trailing wildcard (`geofence:*`) are accepted; subscribing
    /// replaces any previous subscription.
    Subscribe { topics: Vec<String> },
}

/// Server message sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    /// A tracking event matching the subscription
    Event { event: TrackingEvent },
}

fn topic_matches(patterns: &HashSet<String>, topic: &str) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            topic.starts_with(prefix)
        } else {
            pattern == topic
        }
    })
}

/// WebSocket endpoint for live tracking events
pub async fn ws_tracking(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.publisher.subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();

    let connected_msg = ServerMessage::Connected {
        message: "Connected to tracking events. Send subscribe message with topics.".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Channel to communicate subscriptions from receiver loop to sender task
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel::<Vec<String>>(16);

    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(topics) = sub_rx.recv() => {
                    subscribed = topics.into_iter().collect();
                }
                result = event_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if subscribed.is_empty() || !topic_matches(&subscribed, &event.topic) {
                                continue;
                            }
                            let msg = ServerMessage::Event { event };
                            if let Ok(json) = serde_json::to_string(&msg) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "WebSocket client lagged behind event stream");
                            continue;
                        }
                    }
                }
            }
        }
    });

    // Handle incoming messages from client
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(ClientMessage::Subscribe { topics }) =
                    serde_json::from_str::<ClientMessage>(&text)
                {
                    let _ = sub_tx.send(topics).await;
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_topic_matches() {
        let subs = patterns(&["location:bus-1"]);
        assert!(topic_matches(&subs, "location:bus-1"));
        assert!(!topic_matches(&subs, "location:bus-2"));
        assert!(!topic_matches(&subs, "geofence:bus-1"));
    }

    #[test]
    fn wildcard_matches_prefix() {
        let subs = patterns(&["geofence:*"]);
        assert!(topic_matches(&subs, "geofence:bus-1"));
        assert!(topic_matches(&subs, "geofence:bus-2"));
        assert!(!topic_matches(&subs, "trip:7"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        let subs = patterns(&["*"]);
        assert!(topic_matches(&subs, "trip:7"));
        assert!(topic_matches(&subs, "location:bus-1"));
    }
}
