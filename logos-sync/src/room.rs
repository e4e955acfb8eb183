//! A single collaboration room: connection registry, presence and rate state.
//!
//! The four client-indexed maps (connections, presence, client→user and rate
//! state) are private and always change together, so a client is either in
//! all of them or in none.
//!
//! The room never writes to a socket. [`Room::broadcast`] only returns the
//! handles that should receive a frame; the transport does the sending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::limiter::{RateDecision, RateLimiter};
use crate::presence::{Cursor, Participant, UserPresence};

/// Transport-owned connection handle. The room holds a reference only.
pub trait ConnectionHandle: Send + Sync {
    /// Whether the underlying connection can still accept frames.
    fn is_open(&self) -> bool;

    /// Queue a frame for delivery. Returns `false` if the connection is gone.
    fn send(&self, frame: Arc<str>) -> bool;
}

/// Connection handle backed by an unbounded tokio channel.
///
/// The receiving half is drained by the connection's writer task.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    sender: mpsc::UnboundedSender<Arc<str>>,
}

impl ChannelHandle {
    /// Create a handle and the receiver its writer task should drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<str>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ConnectionHandle for ChannelHandle {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn send(&self, frame: Arc<str>) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// One recipient of a broadcast.
#[derive(Clone)]
pub struct BroadcastTarget {
    pub client_id: String,
    pub handle: Arc<dyn ConnectionHandle>,
}

impl std::fmt::Debug for BroadcastTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTarget")
            .field("client_id", &self.client_id)
            .field("open", &self.handle.is_open())
            .finish()
    }
}

/// Result of admitting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant_count: usize,
    /// The client id was already connected; only its handle was replaced
    pub rejoined: bool,
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Whether the client was connected
    pub success: bool,
    pub participant_count: usize,
    pub is_empty: bool,
}

/// Room health snapshot for stats endpoints.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetrics {
    pub room_id: String,
    pub participant_count: usize,
    pub max_participants: usize,
    pub unique_users: usize,
    pub queue_depth: usize,
    pub backpressured_clients: usize,
    pub ops_accepted: u64,
    pub ops_rejected: u64,
    pub created_at: u64,
    pub idle_ms: u64,
}

/// An active collaboration session.
pub struct Room {
    room_id: String,
    max_participants: usize,
    ttl: Duration,
    created_at: u64,
    last_activity: Instant,
    connections: HashMap<String, Arc<dyn ConnectionHandle>>,
    presence: HashMap<String, UserPresence>,
    client_to_user: HashMap<String, String>,
    limiter: RateLimiter,
    ops_accepted: u64,
    ops_rejected: u64,
}

impl Room {
    pub fn new(room_id: impl Into<String>, config: &RoomConfig) -> Self {
        Self {
            room_id: room_id.into(),
            max_participants: config.max_participants,
            ttl: config.ttl,
            created_at: crate::now_millis(),
            last_activity: Instant::now(),
            connections: HashMap::new(),
            presence: HashMap::new(),
            client_to_user: HashMap::new(),
            limiter: RateLimiter::new(config),
            ops_accepted: 0,
            ops_rejected: 0,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    /// Admit a connection.
    ///
    /// A client id that is already connected gets its handle replaced and
    /// keeps its presence; this does not count against capacity.
    pub fn add_connection(
        &mut self,
        client_id: &str,
        handle: Arc<dyn ConnectionHandle>,
        user_id: &str,
    ) -> Result<JoinOutcome, RoomError> {
        let rejoined = self.connections.contains_key(client_id);
        if !rejoined && self.connections.len() >= self.max_participants {
            return Err(RoomError::Capacity {
                room_id: self.room_id.clone(),
                max_participants: self.max_participants,
            });
        }

        self.connections.insert(client_id.to_string(), handle);
        self.client_to_user
            .insert(client_id.to_string(), user_id.to_string());
        self.limiter.add_client(client_id);
        match self.presence.get_mut(client_id) {
            Some(existing) => {
                existing.user_id = user_id.to_string();
                existing.touch();
            }
            None => {
                self.presence
                    .insert(client_id.to_string(), UserPresence::new(user_id, client_id));
            }
        }
        self.last_activity = Instant::now();

        Ok(JoinOutcome {
            participant_count: self.connections.len(),
            rejoined,
        })
    }

    /// Remove a connection from all four maps.
    pub fn remove_connection(&mut self, client_id: &str) -> LeaveOutcome {
        let success = self.connections.remove(client_id).is_some();
        self.presence.remove(client_id);
        self.client_to_user.remove(client_id);
        self.limiter.remove_client(client_id);
        if success {
            self.last_activity = Instant::now();
        }

        LeaveOutcome {
            success,
            participant_count: self.connections.len(),
            is_empty: self.connections.is_empty(),
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn user_of(&self, client_id: &str) -> Option<&str> {
        self.client_to_user.get(client_id).map(String::as_str)
    }

    pub fn presence_of(&self, client_id: &str) -> Option<&UserPresence> {
        self.presence.get(client_id)
    }

    pub fn handle(&self, client_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
        self.connections.get(client_id).cloned()
    }

    /// Participants ordered by join time, then client id.
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> =
            self.presence.values().map(UserPresence::participant).collect();
        list.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        list
    }

    /// Move a client's cursor. `false` if the client is gone.
    pub fn update_cursor(&mut self, client_id: &str, cursor: Cursor) -> bool {
        match self.presence.get_mut(client_id) {
            Some(p) => {
                p.move_cursor(cursor);
                self.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record activity for a client. `false` if the client is gone.
    pub fn update_activity(&mut self, client_id: &str) -> bool {
        match self.presence.get_mut(client_id) {
            Some(p) => {
                p.touch();
                self.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Open connections other than `exclude_client_id`.
    pub fn broadcast(&self, exclude_client_id: Option<&str>) -> Vec<BroadcastTarget> {
        self.connections
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude_client_id)
            .filter(|(_, handle)| handle.is_open())
            .map(|(id, handle)| BroadcastTarget {
                client_id: id.clone(),
                handle: handle.clone(),
            })
            .collect()
    }

    /// Rate-limit one operation from `client_id`.
    pub fn apply_rate_limit(&mut self, client_id: &str) -> RateDecision {
        self.apply_rate_limit_at(client_id, Instant::now())
    }

    pub fn apply_rate_limit_at(&mut self, client_id: &str, now: Instant) -> RateDecision {
        let decision = self.limiter.check_at(client_id, now);
        if decision.allowed() {
            self.ops_accepted += 1;
            self.last_activity = now.max(self.last_activity);
        } else {
            self.ops_rejected += 1;
            log::warn!(
                "Room {}: rejected operation from {client_id}: {}",
                self.room_id,
                decision.reason().unwrap_or("rejected")
            );
        }
        decision
    }

    pub fn metrics(&self) -> RoomMetrics {
        let now = Instant::now();
        let mut users: Vec<&str> = self.client_to_user.values().map(String::as_str).collect();
        users.sort_unstable();
        users.dedup();

        RoomMetrics {
            room_id: self.room_id.clone(),
            participant_count: self.connections.len(),
            max_participants: self.max_participants,
            unique_users: users.len(),
            queue_depth: self.limiter.queue_depth_at(now),
            backpressured_clients: self.limiter.backpressured_count(),
            ops_accepted: self.ops_accepted,
            ops_rejected: self.ops_rejected,
            created_at: self.created_at,
            idle_ms: now.saturating_duration_since(self.last_activity).as_millis() as u64,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Idle for longer than the ttl.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.ttl
    }

    #[cfg(test)]
    fn maps_consistent(&self) -> bool {
        self.connections.len() == self.presence.len()
            && self.connections.len() == self.client_to_user.len()
            && self.connections.len() == self.limiter.len()
            && self.connections.keys().all(|k| {
                self.presence.contains_key(k)
                    && self.client_to_user.contains_key(k)
                    && self.limiter.contains(k)
            })
    }
}
