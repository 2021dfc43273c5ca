//! Relay endpoint and gateway router.
//!
//! Every `GET /ws` upgrade gets its own task that shuttles frames between the
//! socket and the hub. The task knows nothing about roles: it only enforces
//! the classification deadline and writes what the hub tells it to.

use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::{any, get},
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, warn, Instrument};

use super::bridge;
use super::hub::{HubHandle, Inbound};
use super::table::{ConnectionId, Outbound};
use crate::state::GatewayState;

/// Frames queued per connection before the hub starts dropping.
const OUTBOUND_QUEUE: usize = 256;

/// Build the gateway router: relay socket, HTTP bridge and health.
pub fn gateway_router(state: GatewayState) -> Router {
    let bridge_routes = Router::new()
        .route("/api/proxy/{backend_id}", any(bridge::proxy_root))
        .route("/api/proxy/{backend_id}/{*subpath}", any(bridge::proxy_path))
        .layer(ConcurrencyLimitLayer::new(
            state.config.server.max_concurrent_bridge_requests,
        ));

    Router::new()
        .route("/ws", get(relay_ws))
        .route("/api/health", get(crate::routes::health::health))
        .merge(bridge_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /ws`: duplex relay connection for backends and clients alike.
async fn relay_ws(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    let classify_timeout = state.config.gateway.classify_timeout();
    ws.max_message_size(state.config.gateway.max_message_bytes)
        .on_upgrade(move |socket| {
            let conn_id = hub.next_connection_id();
            handle_relay_ws(socket, hub, conn_id, classify_timeout)
                .instrument(info_span!("relay_conn", conn = conn_id))
        })
}

async fn handle_relay_ws(
    socket: WebSocket,
    hub: HubHandle,
    conn_id: ConnectionId,
    classify_timeout: Duration,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    if !hub.open(conn_id, out_tx).await {
        warn!("Gateway hub unavailable, dropping connection");
        return;
    }

    // Write whatever the hub queues; a Close ends the connection.
    let mut send_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let frame = match out {
                Outbound::Message(msg) => Message::Text(msg.to_json().into()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close { reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let deadline = tokio::time::sleep(classify_timeout);
    tokio::pin!(deadline);
    let mut first_frame_seen = false;

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            () = &mut deadline, if !first_frame_seen => {
                warn!(secs = classify_timeout.as_secs(), "No first frame in time, closing");
                break;
            }
            _ = &mut send_task => break,
        };
        match msg {
            Message::Text(text) => {
                first_frame_seen = true;
                if !hub.frame(conn_id, Inbound::Text(text.to_string())).await {
                    break;
                }
            }
            Message::Binary(_) => {
                first_frame_seen = true;
                if !hub.frame(conn_id, Inbound::Binary).await {
                    break;
                }
            }
            Message::Pong(_) => hub.pong(conn_id).await,
            Message::Ping(_) => {}
            Message::Close(_) => break,
        }
    }

    hub.closed(conn_id).await;
    send_task.abort();
    debug!("Relay connection task finished");
}
