//! Gateway reactor.
//!
//! One task owns every piece of mutable relay state: the [`ConnectionTable`],
//! the [`Registry`], the pending bridge calls and the per-IP [`RateLimiter`].
//! WebSocket tasks and HTTP handlers reach it only through [`HubHandle`], and
//! each command runs to completion before the next is taken, so none of that
//! state needs a lock.
//!
//! Bridge timeouts come back as messages on the hub's own channel. A pending
//! call is therefore removed either by its response or by its timer, inside
//! this task, and never twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::bridge::{build_proxy_request, BridgeCall, BridgeError, BridgeReply, PendingRequests};
use super::protocol::{ErrorCode, ProxyResponse, RelayMessage};
use super::ratelimit::RateLimiter;
use super::table::{ConnectionId, ConnectionTable, Outbound, Role, SendError};
use crate::auth::{secret_matches, BridgeCredential};
use crate::config::GatewayConfig;
use crate::registry::Registry;

const COMMAND_QUEUE: usize = 1024;

/// A frame read from a relay connection.
#[derive(Debug, Clone)]
pub enum Inbound {
    Text(String),
    /// Binary frames are not part of the protocol.
    Binary,
}

pub enum HubCommand {
    Open {
        conn_id: ConnectionId,
        outbound: mpsc::Sender<Outbound>,
    },
    Frame {
        conn_id: ConnectionId,
        frame: Inbound,
    },
    Pong {
        conn_id: ConnectionId,
    },
    Closed {
        conn_id: ConnectionId,
    },
    Bridge {
        call: BridgeCall,
        reply: BridgeReply,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Point-in-time counters, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubSnapshot {
    pub connections: usize,
    pub backends: usize,
    pub clients: usize,
    pub unclassified: usize,
    pub pending_requests: usize,
}

/// Reactor tuning, taken from `[gateway]`.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub secret: String,
    pub ping_interval: Duration,
    pub bridge_timeout: Duration,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_sweep: Duration,
    pub max_connections: usize,
}

impl From<&GatewayConfig> for HubSettings {
    fn from(g: &GatewayConfig) -> Self {
        Self {
            secret: g.secret.clone(),
            ping_interval: g.ping_interval(),
            bridge_timeout: g.bridge_timeout(),
            rate_limit_max: g.rate_limit_max,
            rate_limit_window: g.rate_limit_window(),
            rate_limit_sweep: g.rate_limit_sweep(),
            max_connections: g.max_connections,
        }
    }
}

/// Cloneable sender side of the reactor.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Announce a new connection. Returns `false` if the hub is gone.
    pub async fn open(&self, conn_id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> bool {
        self.tx
            .send(HubCommand::Open { conn_id, outbound })
            .await
            .is_ok()
    }

    pub async fn frame(&self, conn_id: ConnectionId, frame: Inbound) -> bool {
        self.tx
            .send(HubCommand::Frame { conn_id, frame })
            .await
            .is_ok()
    }

    pub async fn pong(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Pong { conn_id }).await;
    }

    pub async fn closed(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Closed { conn_id }).await;
    }

    /// Run one bridge call and wait for its outcome.
    pub async fn bridge(&self, call: BridgeCall) -> Result<ProxyResponse, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Bridge { call, reply })
            .await
            .map_err(|_| BridgeError::Unavailable)?;
        rx.await.unwrap_or(Err(BridgeError::Unavailable))
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Close every connection, fail outstanding bridge calls and stop the hub.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Hub {
    settings: HubSettings,
    registry: Registry,
    table: ConnectionTable,
    pending: PendingRequests,
    limiter: RateLimiter,
    rx: mpsc::Receiver<HubCommand>,
    timeout_tx: mpsc::UnboundedSender<String>,
    timeout_rx: mpsc::UnboundedReceiver<String>,
}

impl Hub {
    pub fn new(settings: HubSettings, registry: Registry) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let limiter = RateLimiter::new(settings.rate_limit_max, settings.rate_limit_window);
        let hub = Self {
            settings,
            registry,
            table: ConnectionTable::new(),
            pending: PendingRequests::new(),
            limiter,
            rx,
            timeout_tx,
            timeout_rx,
        };
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let ping_every = self.settings.ping_interval;
        let sweep_every = self.settings.rate_limit_sweep;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(registered = self.registry.len(), "Gateway hub started");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(HubCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(request_id) = self.timeout_rx.recv() => {
                    self.pending.expire(&request_id);
                }
                _ = ping.tick() => self.liveness_tick(),
                _ = sweep.tick() => {
                    let removed = self.limiter.sweep(Instant::now());
                    if removed > 0 {
                        debug!(removed, "Swept expired rate-limit windows");
                    }
                }
            }
        }
        info!("Gateway hub stopped");
    }

    async fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Open { conn_id, outbound } => self.open(conn_id, outbound),
            HubCommand::Frame { conn_id, frame } => self.on_frame(conn_id, frame).await,
            HubCommand::Pong { conn_id } => self.table.mark_alive(conn_id),
            HubCommand::Closed { conn_id } => {
                if self.table.remove(conn_id).is_some() {
                    info!(conn = conn_id, "Relay connection closed");
                }
            }
            HubCommand::Bridge { call, reply } => self.start_bridge(call, reply),
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Intercepted by the run loop.
            HubCommand::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        let connections = self.table.connection_count();
        let backends = self.table.backend_count();
        let clients = self.table.client_count();
        HubSnapshot {
            connections,
            backends,
            clients,
            unclassified: connections.saturating_sub(backends + clients),
            pending_requests: self.pending.len(),
        }
    }

    fn open(&mut self, conn_id: ConnectionId, outbound: mpsc::Sender<Outbound>) {
        if self.table.connection_count() >= self.settings.max_connections {
            warn!(
                conn = conn_id,
                max = self.settings.max_connections,
                "Connection limit reached, rejecting"
            );
            let _ = outbound.try_send(Outbound::Message(RelayMessage::error(
                ErrorCode::ConnectionLimit,
                "Too many connections",
            )));
            let _ = outbound.try_send(Outbound::Close {
                reason: "connection limit".into(),
            });
            return;
        }
        self.table.insert(conn_id, outbound);
        debug!(conn = conn_id, "Relay connection opened");
    }

    /// Send a diagnostic and close: the path for a rejected first frame.
    fn reject(&mut self, conn_id: ConnectionId, reply: RelayMessage, reason: &str) {
        self.table.send(conn_id, reply);
        self.table.close(conn_id, reason);
    }

    async fn on_frame(&mut self, conn_id: ConnectionId, frame: Inbound) {
        let Some(role) = self.table.role(conn_id).cloned() else {
            return;
        };
        let parsed = match frame {
            Inbound::Text(text) => serde_json::from_str::<RelayMessage>(&text)
                .map_err(|e| format!("Invalid message: {e}")),
            Inbound::Binary => Err("Binary frames are not supported".to_string()),
        };

        match (role, parsed) {
            (Role::Unclassified, Err(detail)) => {
                warn!(conn = conn_id, "Malformed first frame");
                self.reject(
                    conn_id,
                    RelayMessage::error(ErrorCode::MalformedMessage, detail),
                    "malformed message",
                );
            }
            (Role::Unclassified, Ok(msg)) => self.classify(conn_id, msg).await,
            (_, Err(detail)) => {
                debug!(conn = conn_id, "Malformed frame");
                self.table
                    .send(conn_id, RelayMessage::error(ErrorCode::MalformedMessage, detail));
            }
            (Role::Backend { backend_id }, Ok(msg)) => {
                self.on_backend_message(conn_id, &backend_id, msg);
            }
            (Role::Client { client_id }, Ok(msg)) => {
                self.on_client_message(conn_id, &client_id, msg);
            }
        }
    }

    async fn classify(&mut self, conn_id: ConnectionId, msg: RelayMessage) {
        match msg {
            RelayMessage::Register {
                secret,
                device_id,
                display_name,
            } => {
                if !secret_matches(&self.settings.secret, &secret) {
                    warn!(conn = conn_id, "Backend registration rejected: invalid secret");
                    self.reject(
                        conn_id,
                        RelayMessage::RegisterResult {
                            success: false,
                            backend_id: None,
                            error: Some("Invalid secret".into()),
                        },
                        "authentication failed",
                    );
                    return;
                }
                let backend_id = match self
                    .registry
                    .get_or_create_backend_id(&device_id, display_name.as_deref())
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(conn = conn_id, error = %e, "Backend registration failed");
                        self.reject(
                            conn_id,
                            RelayMessage::RegisterResult {
                                success: false,
                                backend_id: None,
                                error: Some("Registration failed".into()),
                            },
                            "registration failed",
                        );
                        return;
                    }
                };
                let display_name = self
                    .registry
                    .get(&device_id)
                    .and_then(|r| r.display_name.clone());
                if let Some(old) =
                    self.table
                        .register_backend(conn_id, &backend_id, &device_id, display_name)
                {
                    info!(backend_id = %backend_id, replaced = old, "Backend connection replaced");
                }
                info!(conn = conn_id, backend_id = %backend_id, "Backend registered");
                self.table.send(
                    conn_id,
                    RelayMessage::RegisterResult {
                        success: true,
                        backend_id: Some(backend_id),
                        error: None,
                    },
                );
            }
            RelayMessage::GatewayAuth { secret } => {
                if !secret_matches(&self.settings.secret, &secret) {
                    warn!(conn = conn_id, "Client authentication rejected: invalid secret");
                    self.reject(
                        conn_id,
                        RelayMessage::GatewayAuthResult {
                            success: false,
                            client_id: None,
                            error: Some("Invalid secret".into()),
                        },
                        "authentication failed",
                    );
                    return;
                }
                let client_id = self.table.register_client(conn_id);
                info!(conn = conn_id, client_id = %client_id, "Client authenticated");
                self.table.send(
                    conn_id,
                    RelayMessage::GatewayAuthResult {
                        success: true,
                        client_id: Some(client_id),
                        error: None,
                    },
                );
            }
            other => {
                warn!(conn = conn_id, kind = other.kind(), "Invalid first message");
                self.reject(
                    conn_id,
                    RelayMessage::error(
                        ErrorCode::InvalidFirstMessage,
                        "First message must be register or gateway_auth",
                    ),
                    "invalid first message",
                );
            }
        }
    }

    fn on_backend_message(&mut self, conn_id: ConnectionId, backend_id: &str, msg: RelayMessage) {
        match msg {
            RelayMessage::ClientAuthResult {
                client_id: Some(client_id),
                success,
                error,
                ..
            } => {
                let authorized = success && self.table.authorize(&client_id, backend_id);
                debug!(backend_id, client_id = %client_id, success, authorized, "Client auth result");
                let delivered = self.table.send_to_client(
                    &client_id,
                    RelayMessage::ClientAuthResult {
                        client_id: None,
                        backend_id: Some(backend_id.to_string()),
                        success: authorized,
                        error,
                    },
                );
                if !delivered {
                    debug!(backend_id, client_id = %client_id, "Auth result for departed client");
                }
            }
            RelayMessage::ClientAuthResult { client_id: None, .. } => {
                self.table.send(
                    conn_id,
                    RelayMessage::error(ErrorCode::MalformedMessage, "client_auth_result needs clientId"),
                );
            }
            RelayMessage::BackendResponse { client_id, message } => {
                let delivered = self.table.send_to_client(
                    &client_id,
                    RelayMessage::BackendMessage {
                        backend_id: backend_id.to_string(),
                        message,
                    },
                );
                if !delivered {
                    debug!(backend_id, client_id = %client_id, "Response for departed client dropped");
                }
            }
            RelayMessage::HttpProxyResponse(response) => {
                self.pending.resolve(backend_id, response);
            }
            other => {
                self.table.send(
                    conn_id,
                    RelayMessage::error(
                        ErrorCode::UnexpectedMessage,
                        format!("Unexpected message from backend: {}", other.kind()),
                    ),
                );
            }
        }
    }

    fn on_client_message(&mut self, conn_id: ConnectionId, client_id: &str, msg: RelayMessage) {
        match msg {
            RelayMessage::ListBackends => {
                let backends = self.table.backends_list();
                self.table.send(conn_id, RelayMessage::BackendsList { backends });
            }
            RelayMessage::ConnectBackend { backend_id, api_key } => {
                if self.table.backend(&backend_id).is_none() {
                    self.table.send(
                        conn_id,
                        RelayMessage::ClientAuthResult {
                            client_id: None,
                            backend_id: Some(backend_id),
                            success: false,
                            error: Some("Backend not found or offline".into()),
                        },
                    );
                    return;
                }
                debug!(client_id, backend_id = %backend_id, "Client requested backend");
                self.table.send_to_backend(
                    &backend_id,
                    RelayMessage::ClientConnected {
                        client_id: client_id.to_string(),
                    },
                );
                self.table.send_to_backend(
                    &backend_id,
                    RelayMessage::ClientAuth {
                        client_id: client_id.to_string(),
                        api_key,
                    },
                );
            }
            RelayMessage::SendToBackend { backend_id, message } => {
                if !self.table.is_authorized(client_id, &backend_id) {
                    self.table.send(
                        conn_id,
                        RelayMessage::error(
                            ErrorCode::NotAuthenticated,
                            format!("Not authenticated with backend {backend_id}"),
                        ),
                    );
                    return;
                }
                if self.table.backend(&backend_id).is_none() {
                    self.table.revoke(client_id, &backend_id);
                    self.table
                        .send(conn_id, RelayMessage::BackendDisconnected { backend_id });
                    return;
                }
                self.table.send_to_backend(
                    &backend_id,
                    RelayMessage::Forwarded {
                        client_id: client_id.to_string(),
                        message,
                    },
                );
            }
            other => {
                self.table.send(
                    conn_id,
                    RelayMessage::error(
                        ErrorCode::UnexpectedMessage,
                        format!("Unexpected message from client: {}", other.kind()),
                    ),
                );
            }
        }
    }

    fn start_bridge(&mut self, call: BridgeCall, reply: BridgeReply) {
        if !self.limiter.check(call.peer_ip, Instant::now()) {
            debug!(ip = %call.peer_ip, "Bridge call rate limited");
            let _ = reply.send(Err(BridgeError::RateLimited));
            return;
        }
        let credential = match BridgeCredential::from_header(call.authorization.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                let _ = reply.send(Err(BridgeError::Unauthorized(e.to_string())));
                return;
            }
        };
        if !secret_matches(&self.settings.secret, &credential.gateway_secret) {
            warn!(ip = %call.peer_ip, "Bridge call with invalid gateway secret");
            let _ = reply.send(Err(BridgeError::Unauthorized("invalid gateway secret".into())));
            return;
        }
        if self.table.backend(&call.backend_id).is_none() {
            let _ = reply.send(Err(BridgeError::BackendOffline(call.backend_id)));
            return;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let envelope = build_proxy_request(&request_id, &call, &credential.api_key);
        let timer = {
            let timeout_tx = self.timeout_tx.clone();
            let request_id = request_id.clone();
            let after = self.settings.bridge_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = timeout_tx.send(request_id);
            })
        };
        self.pending.insert(
            request_id.clone(),
            call.backend_id.clone(),
            reply,
            timer.abort_handle(),
        );
        debug!(
            request_id = %request_id,
            backend_id = %call.backend_id,
            method = %call.method,
            path = %call.path,
            "Bridge request sent"
        );
        let sent = self
            .table
            .deliver_to_backend(&call.backend_id, RelayMessage::HttpProxyRequest(envelope));
        let err = match sent {
            Ok(()) => return,
            Err(SendError::QueueFull) => BridgeError::BackendBusy(call.backend_id),
            Err(SendError::Gone) => BridgeError::BackendOffline(call.backend_id),
        };
        self.pending.fail(&request_id, err);
    }

    fn liveness_tick(&mut self) {
        for conn_id in self.table.liveness_tick() {
            info!(conn = conn_id, "No pong since last ping, closing");
            self.table.close(conn_id, "ping timeout");
        }
    }

    fn shutdown(&mut self) {
        let ids = self.table.connection_ids();
        info!(connections = ids.len(), pending = self.pending.len(), "Gateway hub shutting down");
        for conn_id in ids {
            self.table.close(conn_id, "gateway shutting down");
        }
        self.pending.fail_all();
    }
}
