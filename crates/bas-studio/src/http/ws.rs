// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry stream over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use bas_core::{SubscriptionFilter, TelemetryHub};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::AppState;
use super::json::ApiQuery;

/// A client that sends nothing for this long is disconnected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StreamQuery {
    #[serde(default)]
    execution_id: Option<String>,
}

pub(super) async fn telemetry_socket(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = Arc::clone(&state.hub);
    let filter = SubscriptionFilter::from(query.execution_id);
    ws.on_upgrade(move |socket| stream_events(socket, hub, filter))
}

async fn stream_events(socket: WebSocket, hub: Arc<TelemetryHub>, filter: SubscriptionFilter) {
    let subscription = hub.subscribe(filter);
    let (mut sender, mut receiver) = socket.split();
    let mut last_seen = Instant::now();
    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    debug!(subscriber = subscription.id(), "Telemetry stream opened");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let raw = match serde_json::to_string(&event) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize telemetry event (non-fatal)");
                        continue;
                    }
                };
                if sender.send(Message::Text(raw.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        debug!(error = %e, "Telemetry stream receive failed");
                        break;
                    }
                }
            }
            _ = idle_check.tick() => {
                if last_seen.elapsed() >= IDLE_TIMEOUT {
                    debug!(subscriber = subscription.id(), "Telemetry stream idle, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    let lagged = subscription.lagged();
    if lagged > 0 {
        warn!(subscriber = subscription.id(), lagged, "Telemetry subscriber dropped events");
    }
    debug!(subscriber = subscription.id(), "Telemetry stream closed");
}
