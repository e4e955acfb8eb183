//! Room manager: maps room ids to rooms and keeps the client/user indices.
//!
//! Each room is owned exclusively by the manager; nothing else mutates a
//! room's maps. The manager also owns the periodic sweep task once one is
//! attached, and stops it on [`RoomManager::shutdown`] or drop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::room::{ConnectionHandle, JoinOutcome, LeaveOutcome, Room, RoomMetrics};

/// Aggregate manager statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub total_rooms: usize,
    pub total_connections: usize,
    pub total_users: usize,
    pub rooms: Vec<RoomMetrics>,
}

pub struct RoomManager {
    rooms: HashMap<String, Room>,
    /// clientId → rooms it is connected to
    client_rooms: HashMap<String, HashSet<String>>,
    /// userId → connected client ids (one per device)
    user_clients: HashMap<String, HashSet<String>>,
    default_config: RoomConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl RoomManager {
    pub fn new(default_config: RoomConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            client_rooms: HashMap::new(),
            user_clients: HashMap::new(),
            default_config,
            sweeper: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RoomConfig::default())
    }

    pub fn default_config(&self) -> &RoomConfig {
        &self.default_config
    }

    /// Get or create a room. An existing room keeps its original config.
    pub fn create_room(&mut self, room_id: &str, config: Option<RoomConfig>) -> &mut Room {
        let default_config = &self.default_config;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| default_config.clone());
            log::info!(
                "Created room {room_id} (max {} participants)",
                config.max_participants
            );
            Room::new(room_id, &config)
        })
    }

    pub fn get_room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Join a client to a room, creating the room on first join.
    pub fn join_room(
        &mut self,
        room_id: &str,
        client_id: &str,
        handle: Arc<dyn ConnectionHandle>,
        user_id: &str,
        config: Option<RoomConfig>,
    ) -> Result<JoinOutcome, RoomError> {
        let room = self.create_room(room_id, config);
        let previous_user = room.user_of(client_id).map(str::to_string);
        let outcome = room.add_connection(client_id, handle, user_id)?;

        self.client_rooms
            .entry(client_id.to_string())
            .or_default()
            .insert(room_id.to_string());
        self.user_clients
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        if let Some(previous) = previous_user.filter(|p| p != user_id) {
            self.reindex_user(&previous, client_id);
        }

        log::info!(
            "Client {client_id} (user {user_id}) {} room {room_id} ({} participants)",
            if outcome.rejoined { "rejoined" } else { "joined" },
            outcome.participant_count
        );
        Ok(outcome)
    }

    /// Remove a client from a room. An emptied room is dropped immediately.
    ///
    /// Document state is not touched; it lives in the OT engine.
    pub fn leave_room(&mut self, room_id: &str, client_id: &str) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return LeaveOutcome {
                success: false,
                participant_count: 0,
                is_empty: true,
            };
        };

        let user_id = room.user_of(client_id).map(str::to_string);
        let outcome = room.remove_connection(client_id);

        if outcome.success {
            if let Some(rooms) = self.client_rooms.get_mut(client_id) {
                rooms.remove(room_id);
                if rooms.is_empty() {
                    self.client_rooms.remove(client_id);
                }
            }
            if let Some(user_id) = user_id {
                self.reindex_user(&user_id, client_id);
            }
            log::info!(
                "Client {client_id} left room {room_id} ({} participants)",
                outcome.participant_count
            );
        }

        if outcome.is_empty {
            self.rooms.remove(room_id);
            log::info!("Removed empty room {room_id}");
        }
        outcome
    }

    /// Whether `client_id` is joined as `user_id` in any room.
    fn client_acts_as(&self, client_id: &str, user_id: &str) -> bool {
        self.client_rooms.get(client_id).is_some_and(|rooms| {
            rooms.iter().any(|room_id| {
                self.rooms
                    .get(room_id)
                    .and_then(|room| room.user_of(client_id))
                    == Some(user_id)
            })
        })
    }

    /// Drop the user→client entry unless some room still joins them.
    fn reindex_user(&mut self, user_id: &str, client_id: &str) {
        if self.client_acts_as(client_id, user_id) {
            return;
        }
        if let Some(clients) = self.user_clients.get_mut(user_id) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.user_clients.remove(user_id);
            }
        }
    }

    /// Rooms a client is connected to, sorted.
    pub fn get_client_rooms(&self, client_id: &str) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .client_rooms
            .get(client_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Rooms where one of a user's clients is joined as that user, sorted and deduplicated.
    pub fn get_user_rooms(&self, user_id: &str) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .user_clients
            .get(user_id)
            .into_iter()
            .flatten()
            .flat_map(|client_id| {
                self.get_client_rooms(client_id)
                    .into_iter()
                    .filter(move |room_id| {
                        self.rooms.get(room_id).and_then(|room| room.user_of(client_id))
                            == Some(user_id)
                    })
            })
            .collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    /// Clients currently connected for a user, sorted.
    pub fn get_user_clients(&self, user_id: &str) -> Vec<String> {
        let mut clients: Vec<String> = self
            .user_clients
            .get(user_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    /// Remove rooms that are both empty and past their ttl.
    pub fn cleanup_expired_rooms(&mut self) -> Vec<String> {
        self.cleanup_expired_rooms_at(Instant::now())
    }

    pub fn cleanup_expired_rooms_at(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.is_empty() && room.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in &expired {
            self.rooms.remove(room_id);
            log::info!("Swept expired room {room_id}");
        }
        expired
    }

    pub fn get_stats(&self) -> ManagerStats {
        let mut rooms: Vec<RoomMetrics> = self.rooms.values().map(Room::metrics).collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        ManagerStats {
            total_rooms: self.rooms.len(),
            total_connections: rooms.iter().map(|r| r.participant_count).sum(),
            total_users: self.user_clients.len(),
            rooms,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Take ownership of the periodic sweep task, replacing any previous one.
    pub fn attach_sweeper(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.sweeper.replace(handle) {
            old.abort();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the periodic sweep. Rooms are left in place.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
            log::info!("Room sweep stopped");
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}
