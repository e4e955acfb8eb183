//! Per-client sliding-window rate limiting with room-wide backpressure.
//!
//! Each client keeps the instants of its accepted operations inside the
//! window. The sum over all clients is the room's queue depth; when it
//! exceeds the threshold the requesting client is flagged backpressured and
//! stays flagged until its own window drains to zero.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::RoomConfig;

/// Outcome of a rate-limit check. Rejections are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Client's own window is full
    RateLimited,
    /// Room-wide depth exceeded, or client still draining from an earlier flag
    Backpressured,
    /// Client has no rate state (not connected to this room)
    UnknownClient,
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    pub fn is_backpressured(&self) -> bool {
        matches!(self, RateDecision::Backpressured)
    }

    /// Human-readable rejection reason.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::RateLimited => Some("Rate limit exceeded"),
            RateDecision::Backpressured => Some("Backpressure: room queue depth exceeded"),
            RateDecision::UnknownClient => Some("Client not connected to room"),
        }
    }

    /// Wire error code for a rejection.
    pub fn code(&self) -> Option<&'static str> {
        use crate::error::codes;
        match self {
            RateDecision::Allowed => None,
            RateDecision::RateLimited => Some(codes::RATE_LIMITED),
            RateDecision::Backpressured => Some(codes::BACKPRESSURE),
            RateDecision::UnknownClient => Some(codes::NOT_IN_ROOM),
        }
    }
}

/// Rate state for one client.
#[derive(Debug, Clone, Default)]
pub struct ClientRateState {
    /// Instants of accepted operations, oldest first
    window: VecDeque<Instant>,
    backpressured: bool,
}

impl ClientRateState {
    /// Accepted operations still inside the window (as of the last prune).
    pub fn in_window(&self) -> usize {
        self.window.len()
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.window.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Rate limiter for all clients of one room.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    clients: HashMap<String, ClientRateState>,
    window: Duration,
    max_per_window: usize,
    backpressure_threshold: usize,
}

impl RateLimiter {
    pub fn new(config: &RoomConfig) -> Self {
        Self {
            clients: HashMap::new(),
            window: config.rate_window,
            max_per_window: config.max_ops_per_window,
            backpressure_threshold: config.backpressure_threshold,
        }
    }

    /// Start tracking a client. Existing state is kept (reconnect).
    pub fn add_client(&mut self, client_id: &str) {
        self.clients.entry(client_id.to_string()).or_default();
    }

    /// Stop tracking a client.
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_state(&self, client_id: &str) -> Option<&ClientRateState> {
        self.clients.get(client_id)
    }

    /// Check and record one operation for `client_id` at the current instant.
    pub fn check(&mut self, client_id: &str) -> RateDecision {
        self.check_at(client_id, Instant::now())
    }

    /// Check and record one operation for `client_id` at `now`.
    pub fn check_at(&mut self, client_id: &str, now: Instant) -> RateDecision {
        if !self.clients.contains_key(client_id) {
            return RateDecision::UnknownClient;
        }

        for state in self.clients.values_mut() {
            state.prune(now, self.window);
        }
        let queue_depth: usize = self.clients.values().map(ClientRateState::in_window).sum();

        let Some(state) = self.clients.get_mut(client_id) else {
            return RateDecision::UnknownClient;
        };

        if state.backpressured {
            if state.window.is_empty() {
                state.backpressured = false;
            } else {
                return RateDecision::Backpressured;
            }
        }

        if state.window.len() >= self.max_per_window {
            return RateDecision::RateLimited;
        }

        if queue_depth > self.backpressure_threshold {
            state.backpressured = true;
            return RateDecision::Backpressured;
        }

        state.window.push_back(now);
        RateDecision::Allowed
    }

    /// Room-wide count of in-window operations at `now`.
    pub fn queue_depth_at(&self, now: Instant) -> usize {
        self.clients
            .values()
            .map(|s| {
                s.window
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < self.window)
                    .count()
            })
            .sum()
    }

    /// Number of clients currently flagged backpressured.
    pub fn backpressured_count(&self) -> usize {
        self.clients.values().filter(|s| s.backpressured).count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
