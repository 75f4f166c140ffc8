// crates/core/src/hub.rs
//! Room-based fan-out of server events to connected clients.
//!
//! Delivery is fire-and-forget: each connection owns an unbounded queue
//! drained by its transport task, so `publish` never blocks on a slow client.
//! A disconnected subscriber simply misses updates until it rejoins.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ServerEvent;

/// Opaque identifier of one realtime connection.
pub type ConnectionId = String;

/// Room name for a project-scoped session.
pub fn project_room(project_id: &str) -> String {
    format!("project_{project_id}")
}

#[derive(Default)]
pub struct BroadcastHub {
    /// Outbound queue per connection.
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    /// Room name -> member connections.
    rooms: DashMap<String, HashSet<ConnectionId>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's outbound queue. Replaces any previous queue
    /// registered under the same id.
    pub fn register(&self, connection_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.connections.insert(connection_id.to_string(), tx);
    }

    /// Drop a connection and remove it from every room. Returns the rooms it
    /// was in.
    pub fn unregister(&self, connection_id: &str) -> Vec<String> {
        self.connections.remove(connection_id);
        let rooms = self.rooms_of(connection_id);
        for room in &rooms {
            self.unsubscribe(room, connection_id);
        }
        rooms
    }

    pub fn subscribe(&self, room: &str, connection_id: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(room = %room, connection_id = %connection_id, "subscribed");
    }

    pub fn unsubscribe(&self, room: &str, connection_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Drop a room and return the connections that were in it.
    pub fn clear_room(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .remove(room)
            .map(|(_, members)| members.into_iter().collect())
            .unwrap_or_default()
    }

    /// Deliver `event` to every current member of `room`. Returns how many
    /// queues accepted it.
    pub fn publish(&self, room: &str, event: ServerEvent) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for member in members {
            match self.connections.get(&member) {
                Some(tx) if tx.send(event.clone()).is_ok() => delivered += 1,
                Some(_) => closed.push(member),
                None => {}
            }
        }

        // Queues whose receiver is gone belong to connections that dropped
        // without a clean unregister.
        for member in closed {
            debug!(connection_id = %member, "dropping closed connection");
            self.unregister(&member);
        }
        delivered
    }

    /// Send directly to one connection, outside any room.
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        self.connections
            .get(connection_id)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().contains(connection_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
