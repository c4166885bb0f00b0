use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde_json::Value;
use shared::models::{Message, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// What to do with a frame when a connection's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for room in the queue, up to the hub's send timeout.
    Reliable,
    /// Drop the frame; a later snapshot supersedes it.
    Droppable,
}

/// A frame on its way to one or more connections.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Event name.
    pub event: &'static str,
    /// Event payload.
    pub payload: Value,
    /// Backpressure policy.
    pub delivery: Delivery,
}

impl Outbound {
    /// A frame that must reach every target.
    #[must_use]
    pub fn reliable(event: &'static str, payload: Value) -> Self {
        Self {
            event,
            payload,
            delivery: Delivery::Reliable,
        }
    }

    /// A full-state snapshot that may be skipped under backpressure.
    #[must_use]
    pub fn snapshot(event: &'static str, payload: Value) -> Self {
        Self {
            event,
            payload,
            delivery: Delivery::Droppable,
        }
    }
}

/// Per-connection state the coordinator keeps between turns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSession {
    /// Conversation opened by this connection's first message.
    pub chat_id: Option<String>,
    /// User that opened it.
    pub user_id: Option<String>,
    /// Cached system message.
    pub system_message: Option<Message>,
    /// Document ids the cached system message was built from.
    pub docs: Option<HashSet<String>>,
    /// Token count of those documents.
    pub docs_token_count: u64,
}

/// Room-based pub/sub between the coordinator and connected clients.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Adds a connection to a room.
    async fn join(&self, connection_id: &str, room: &str);

    /// Removes a connection from a room.
    async fn leave(&self, connection_id: &str, room: &str);

    /// Rooms a connection is in.
    async fn rooms_of(&self, connection_id: &str) -> Vec<String>;

    /// Connections in a room.
    async fn room_members(&self, room: &str) -> HashSet<String>;

    /// Sends to every member of `room` except `exclude`.
    async fn broadcast(&self, room: &str, outbound: Outbound, exclude: Option<&str>);

    /// Sends to one connection.
    async fn emit_to(&self, connection_id: &str, outbound: Outbound);

    /// Drops a connection and returns the rooms it was still in.
    async fn disconnect(&self, connection_id: &str) -> Vec<String>;

    /// Session of a connection; the default for unknown connections.
    async fn get_session(&self, connection_id: &str) -> ConnectionSession;

    /// Replaces the session of a connection.
    async fn save_session(&self, connection_id: &str, session: ConnectionSession);
}

struct Connection {
    user_id: String,
    /// `None` once the connection was evicted for not draining its queue.
    sender: Option<mpsc::Sender<ServerFrame>>,
    rooms: HashSet<String>,
    session: ConnectionSession,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    rooms: HashMap<String, HashSet<String>>,
}

impl HubState {
    fn senders(
        &self,
        ids: impl IntoIterator<Item = String>,
    ) -> Vec<(String, mpsc::Sender<ServerFrame>)> {
        ids.into_iter()
            .filter_map(|id| {
                let sender = self.connections.get(&id)?.sender.clone()?;
                Some((id, sender))
            })
            .collect()
    }

    fn remove_from_room(&mut self, connection_id: &str, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

/// In-process [`Transport`] backing the WebSocket gateway.
///
/// Each connection owns a bounded queue drained by its socket writer.
pub struct RoomHub {
    capacity: usize,
    send_timeout: Duration,
    inner: Mutex<HubState>,
}

impl std::fmt::Debug for RoomHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHub")
            .field("capacity", &self.capacity)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

impl RoomHub {
    /// Creates a hub whose connection queues hold `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            inner: Mutex::new(HubState::default()),
        }
    }

    /// Sets how long a reliable frame may wait for queue space before the
    /// connection is evicted.
    #[must_use]
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Registers a connection and returns the receiving end of its queue.
    pub async fn connect(&self, connection_id: &str, user_id: &str) -> mpsc::Receiver<ServerFrame> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let mut guard = self.inner.lock().await;
        guard.connections.insert(
            connection_id.to_string(),
            Connection {
                user_id: user_id.to_string(),
                sender: Some(sender),
                rooms: HashSet::new(),
                session: ConnectionSession::default(),
            },
        );
        record_connections(guard.connections.len());
        receiver
    }

    /// User a connection authenticated as.
    pub async fn user_of(&self, connection_id: &str) -> Option<String> {
        let guard = self.inner.lock().await;
        guard
            .connections
            .get(connection_id)
            .map(|connection| connection.user_id.clone())
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    async fn deliver(&self, targets: Vec<(String, mpsc::Sender<ServerFrame>)>, outbound: Outbound) {
        let frame = ServerFrame::new(outbound.event, outbound.payload);
        for (connection_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => match outbound.delivery {
                    Delivery::Droppable => {
                        counter!("confab_ws_dropped_frames_total").increment(1);
                        debug!(%connection_id, event = outbound.event, "queue full; snapshot dropped");
                    }
                    Delivery::Reliable => {
                        match tokio::time::timeout(self.send_timeout, sender.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => {
                                debug!(%connection_id, "connection closed while waiting for queue space");
                            }
                            Err(_) => self.evict(&connection_id).await,
                        }
                    }
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%connection_id, event = outbound.event, "connection closed; frame discarded");
                }
            }
        }
    }
}

impl RoomHub {
    /// Stops delivering to a connection that is not draining its queue.
    /// Dropping the last sender ends its writer; room membership is kept so
    /// the socket's close still unloads its conversations.
    async fn evict(&self, connection_id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connections.get_mut(connection_id)
            && connection.sender.take().is_some()
        {
            counter!("confab_ws_evicted_total").increment(1);
            warn!(%connection_id, "connection stopped reading; evicted");
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_connections(count: usize) {
    gauge!("confab_ws_connections").set(count as f64);
}

#[async_trait]
impl Transport for RoomHub {
    async fn join(&self, connection_id: &str, room: &str) {
        let mut guard = self.inner.lock().await;
        let Some(connection) = guard.connections.get_mut(connection_id) else {
            return;
        };
        connection.rooms.insert(room.to_string());
        guard
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    async fn leave(&self, connection_id: &str, room: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connections.get_mut(connection_id) {
            connection.rooms.remove(room);
        }
        guard.remove_from_room(connection_id, room);
    }

    async fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard
            .connections
            .get(connection_id)
            .map(|connection| connection.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn room_members(&self, room: &str) -> HashSet<String> {
        self.inner
            .lock()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    async fn broadcast(&self, room: &str, outbound: Outbound, exclude: Option<&str>) {
        let targets = {
            let guard = self.inner.lock().await;
            let members = guard.rooms.get(room).cloned().unwrap_or_default();
            guard.senders(
                members
                    .into_iter()
                    .filter(|member| Some(member.as_str()) != exclude),
            )
        };
        self.deliver(targets, outbound).await;
    }

    async fn emit_to(&self, connection_id: &str, outbound: Outbound) {
        let targets = self
            .inner
            .lock()
            .await
            .senders([connection_id.to_string()]);
        self.deliver(targets, outbound).await;
    }

    async fn disconnect(&self, connection_id: &str) -> Vec<String> {
        let mut guard = self.inner.lock().await;
        let Some(connection) = guard.connections.remove(connection_id) else {
            return Vec::new();
        };
        for room in &connection.rooms {
            guard.remove_from_room(connection_id, room);
        }
        record_connections(guard.connections.len());
        connection.rooms.into_iter().collect()
    }

    async fn get_session(&self, connection_id: &str) -> ConnectionSession {
        let guard = self.inner.lock().await;
        guard
            .connections
            .get(connection_id)
            .map(|connection| connection.session.clone())
            .unwrap_or_default()
    }

    async fn save_session(&self, connection_id: &str, session: ConnectionSession) {
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connections.get_mut(connection_id) {
            connection.session = session;
        }
    }
}
