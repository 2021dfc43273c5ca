//! In-memory table of live relay connections.
//!
//! Owned exclusively by the hub task. Every open WebSocket has a
//! [`Connection`] entry whose [`Role`] starts as `Unclassified` and is set once
//! by the first frame. Backends and clients are additionally indexed by their
//! public ids. Sends never block: a peer with a full queue loses the frame.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::{BackendInfo, RelayMessage};

pub type ConnectionId = u64;

/// What the hub asks a connection task to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(RelayMessage),
    Ping,
    Close { reason: String },
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No such connection, or its task already exited.
    Gone,
    /// The peer is not draining its queue.
    QueueFull,
}

/// Connection role. Set by the first frame, never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unclassified,
    Backend { backend_id: String },
    Client { client_id: String },
}

pub struct Connection {
    pub role: Role,
    /// Cleared on each ping tick, set again by a pong.
    pub alive: bool,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    fn push(&self, id: ConnectionId, out: Outbound) -> Result<(), SendError> {
        match self.tx.try_send(out) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = id, "Dropped outbound frame (peer backpressure)");
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Gone),
        }
    }
}

pub struct ConnectedBackend {
    pub connection_id: ConnectionId,
    pub backend_id: String,
    pub device_id: String,
    pub display_name: Option<String>,
}

pub struct ConnectedClient {
    pub connection_id: ConnectionId,
    pub client_id: String,
    /// Backends this client completed `client_auth` against.
    pub authorized_backends: HashSet<String>,
}

#[derive(Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    backends: HashMap<String, ConnectedBackend>,
    clients: HashMap<String, ConnectedClient>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ConnectionId, tx: mpsc::Sender<Outbound>) {
        self.connections.insert(
            id,
            Connection {
                role: Role::Unclassified,
                alive: true,
                tx,
            },
        );
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn role(&self, id: ConnectionId) -> Option<&Role> {
        self.connections.get(&id).map(|c| &c.role)
    }

    pub fn backend(&self, backend_id: &str) -> Option<&ConnectedBackend> {
        self.backends.get(backend_id)
    }

    pub fn client(&self, client_id: &str) -> Option<&ConnectedClient> {
        self.clients.get(client_id)
    }

    /// Queue a message on a connection. Returns whether it was queued.
    pub fn send(&self, id: ConnectionId, msg: RelayMessage) -> bool {
        self.deliver(id, msg).is_ok()
    }

    /// Like [`send`](Self::send), but says why the frame was not queued.
    pub fn deliver(&self, id: ConnectionId, msg: RelayMessage) -> Result<(), SendError> {
        self.connections
            .get(&id)
            .ok_or(SendError::Gone)?
            .push(id, Outbound::Message(msg))
    }

    pub fn send_to_backend(&self, backend_id: &str, msg: RelayMessage) -> bool {
        self.deliver_to_backend(backend_id, msg).is_ok()
    }

    pub fn deliver_to_backend(&self, backend_id: &str, msg: RelayMessage) -> Result<(), SendError> {
        let backend = self.backends.get(backend_id).ok_or(SendError::Gone)?;
        self.deliver(backend.connection_id, msg)
    }

    pub fn send_to_client(&self, client_id: &str, msg: RelayMessage) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|c| self.send(c.connection_id, msg))
    }

    /// Attach a backend role to `id`. Any other connection holding the same
    /// `backend_id` is removed (running the normal disconnect cleanup) and
    /// asked to close; its id is returned.
    pub fn register_backend(
        &mut self,
        id: ConnectionId,
        backend_id: &str,
        device_id: &str,
        display_name: Option<String>,
    ) -> Option<ConnectionId> {
        let replaced = self
            .backends
            .get(backend_id)
            .map(|b| b.connection_id)
            .filter(|old| *old != id);
        if let Some(old) = replaced {
            self.close(old, "replaced by new connection");
        }

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.role = Role::Backend {
                backend_id: backend_id.to_string(),
            };
        }
        self.backends.insert(
            backend_id.to_string(),
            ConnectedBackend {
                connection_id: id,
                backend_id: backend_id.to_string(),
                device_id: device_id.to_string(),
                display_name,
            },
        );
        replaced
    }

    /// Attach a client role to `id` and return the new client id.
    pub fn register_client(&mut self, id: ConnectionId) -> String {
        let client_id = uuid::Uuid::new_v4().to_string();
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.role = Role::Client {
                client_id: client_id.clone(),
            };
        }
        self.clients.insert(
            client_id.clone(),
            ConnectedClient {
                connection_id: id,
                client_id: client_id.clone(),
                authorized_backends: HashSet::new(),
            },
        );
        client_id
    }

    pub fn backends_list(&self) -> Vec<BackendInfo> {
        let mut list: Vec<BackendInfo> = self
            .backends
            .values()
            .map(|b| BackendInfo {
                backend_id: b.backend_id.clone(),
                display_name: b.display_name.clone(),
                online: true,
            })
            .collect();
        list.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        list
    }

    /// Record a successful per-backend auth. Ignored unless both the client
    /// and the backend are still connected.
    pub fn authorize(&mut self, client_id: &str, backend_id: &str) -> bool {
        if !self.backends.contains_key(backend_id) {
            return false;
        }
        match self.clients.get_mut(client_id) {
            Some(client) => {
                client.authorized_backends.insert(backend_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn revoke(&mut self, client_id: &str, backend_id: &str) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.authorized_backends.remove(backend_id);
        }
    }

    pub fn is_authorized(&self, client_id: &str, backend_id: &str) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|c| c.authorized_backends.contains(backend_id))
    }

    /// Remove a connection and whatever role it held.
    ///
    /// Removing a backend sends `backend_disconnected` to every authorized
    /// client and strips the id from their sets. Removing a client sends
    /// `client_disconnected` to every backend it was authorized against.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        match &conn.role {
            Role::Unclassified => {}
            Role::Backend { backend_id } => {
                let owns_entry = self
                    .backends
                    .get(backend_id)
                    .is_some_and(|b| b.connection_id == id);
                if owns_entry {
                    self.backends.remove(backend_id);
                    self.revoke_everywhere(backend_id);
                }
            }
            Role::Client { client_id } => {
                if let Some(client) = self.clients.remove(client_id) {
                    for backend_id in &client.authorized_backends {
                        self.send_to_backend(
                            backend_id,
                            RelayMessage::ClientDisconnected {
                                client_id: client_id.clone(),
                            },
                        );
                    }
                }
            }
        }
        debug!(conn = id, role = ?conn.role, "Removed connection");
        Some(conn)
    }

    /// Remove a connection and ask its task to close with `reason`.
    pub fn close(&mut self, id: ConnectionId, reason: &str) -> bool {
        match self.remove(id) {
            Some(conn) => {
                let _ = conn.push(
                    id,
                    Outbound::Close {
                        reason: reason.to_string(),
                    },
                );
                true
            }
            None => false,
        }
    }

    fn revoke_everywhere(&mut self, backend_id: &str) {
        let mut notify = Vec::new();
        for client in self.clients.values_mut() {
            if client.authorized_backends.remove(backend_id) {
                notify.push(client.connection_id);
            }
        }
        for conn_id in notify {
            self.send(
                conn_id,
                RelayMessage::BackendDisconnected {
                    backend_id: backend_id.to_string(),
                },
            );
        }
    }

    pub fn mark_alive(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.alive = true;
        }
    }

    /// One liveness tick: connections that did not answer the previous ping
    /// are returned; all others are pinged and marked pending.
    pub fn liveness_tick(&mut self) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for (id, conn) in &mut self.connections {
            if conn.alive {
                conn.alive = false;
                let _ = conn.push(*id, Outbound::Ping);
            } else {
                dead.push(*id);
            }
        }
        dead
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(table: &mut ConnectionTable, id: ConnectionId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        table.insert(id, tx);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(o) = rx.try_recv() {
            out.push(o);
        }
        out
    }

    #[test]
    fn replacing_backend_closes_exactly_one_prior_connection() {
        let mut table = ConnectionTable::new();
        let mut first = conn(&mut table, 1);
        let mut second = conn(&mut table, 2);
        let mut third = conn(&mut table, 3);

        assert_eq!(table.register_backend(1, "b1", "d1", None), None);
        assert_eq!(table.register_backend(2, "b1", "d1", None), Some(1));
        assert_eq!(table.register_backend(3, "b1", "d1", None), Some(2));

        assert_eq!(table.backend_count(), 1);
        assert_eq!(table.backend("b1").unwrap().connection_id, 3);
        assert!(matches!(drain(&mut first).as_slice(), [Outbound::Close { .. }]));
        assert!(matches!(drain(&mut second).as_slice(), [Outbound::Close { .. }]));
        assert!(drain(&mut third).is_empty());
        assert_eq!(table.role(1), None);
    }

    #[test]
    fn backend_removal_notifies_authorized_clients_once() {
        let mut table = ConnectionTable::new();
        let _backend = conn(&mut table, 1);
        let mut authorized = conn(&mut table, 2);
        let mut bystander = conn(&mut table, 3);
        table.register_backend(1, "b1", "d1", Some("box".into()));
        let c1 = table.register_client(2);
        let _c2 = table.register_client(3);
        assert!(table.authorize(&c1, "b1"));

        table.remove(1);

        assert_eq!(
            drain(&mut authorized),
            vec![Outbound::Message(RelayMessage::BackendDisconnected {
                backend_id: "b1".into()
            })]
        );
        assert!(drain(&mut bystander).is_empty());
        assert!(!table.is_authorized(&c1, "b1"));
        assert!(table.backend("b1").is_none());
    }

    #[test]
    fn client_removal_notifies_backends() {
        let mut table = ConnectionTable::new();
        let mut backend = conn(&mut table, 1);
        let _client = conn(&mut table, 2);
        table.register_backend(1, "b1", "d1", None);
        let client_id = table.register_client(2);
        table.authorize(&client_id, "b1");

        table.remove(2);

        assert_eq!(
            drain(&mut backend),
            vec![Outbound::Message(RelayMessage::ClientDisconnected { client_id })]
        );
        assert_eq!(table.client_count(), 0);
    }

    #[test]
    fn stale_close_of_replaced_backend_keeps_new_entry() {
        let mut table = ConnectionTable::new();
        let _a = conn(&mut table, 1);
        let _b = conn(&mut table, 2);
        table.register_backend(1, "b1", "d1", None);
        table.register_backend(2, "b1", "d1", None);
        assert!(table.remove(1).is_none());
        assert_eq!(table.backend("b1").unwrap().connection_id, 2);
    }

    #[test]
    fn authorize_requires_live_backend() {
        let mut table = ConnectionTable::new();
        let _c = conn(&mut table, 1);
        let client_id = table.register_client(1);
        assert!(!table.authorize(&client_id, "ghost"));
        assert!(!table.is_authorized(&client_id, "ghost"));
    }

    #[test]
    fn liveness_tick_reaps_silent_connections() {
        let mut table = ConnectionTable::new();
        let mut quiet = conn(&mut table, 1);
        let _chatty = conn(&mut table, 2);

        assert!(table.liveness_tick().is_empty());
        assert_eq!(drain(&mut quiet), vec![Outbound::Ping]);

        table.mark_alive(2);
        assert_eq!(table.liveness_tick(), vec![1]);
    }

    #[test]
    fn backends_list_is_sorted_and_online() {
        let mut table = ConnectionTable::new();
        let _a = conn(&mut table, 1);
        let _b = conn(&mut table, 2);
        table.register_backend(1, "zz", "d1", None);
        table.register_backend(2, "aa", "d2", Some("two".into()));
        let list = table.backends_list();
        assert_eq!(list[0].backend_id, "aa");
        assert_eq!(list[0].display_name.as_deref(), Some("two"));
        assert!(list.iter().all(|b| b.online));
    }
}
