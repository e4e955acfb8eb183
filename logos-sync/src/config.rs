//! Configuration for rooms, the OT engine and the sync server.
//!
//! Every struct carries production defaults via `Default` and a
//! `for_testing()` constructor with small windows so tests stay fast.

use std::time::Duration;

/// Per-room admission and expiry settings.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum simultaneous connections in one room (default: 50)
    pub max_participants: usize,
    /// Idle window after which an empty room may be swept (default: 30 min)
    pub ttl: Duration,
    /// Sliding rate-limit window per client (default: 1000ms)
    pub rate_window: Duration,
    /// Accepted operations per client inside one window (default: 50)
    pub max_ops_per_window: usize,
    /// Room-wide in-window operation count that triggers backpressure (default: 100)
    pub backpressure_threshold: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_participants: 50,
            ttl: Duration::from_secs(30 * 60),
            rate_window: Duration::from_millis(1000),
            max_ops_per_window: 50,
            backpressure_threshold: 100,
        }
    }
}

impl RoomConfig {
    /// Config for testing (tiny room, short ttl).
    pub fn for_testing() -> Self {
        Self {
            max_participants: 4,
            ttl: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Same config with a different participant cap.
    pub fn with_max_participants(mut self, max_participants: usize) -> Self {
        self.max_participants = max_participants;
        self
    }
}

/// Operation validation limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum characters in one operation's content (default: 10000)
    pub max_content_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 10_000,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Defaults applied to rooms created on first join
    pub room: RoomConfig,
    /// Operation limits
    pub engine: EngineConfig,
    /// Interval of the expired-room sweep (default: 60s)
    pub sweep_interval: Duration,
    /// Persist a snapshot every N applied operations per room (0 = never)
    pub snapshot_every: u64,
    /// Maximum length of roomId/userId/clientId/operationId (default: 100)
    pub max_identifier_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            room: RoomConfig::default(),
            engine: EngineConfig::default(),
            sweep_interval: Duration::from_secs(60),
            snapshot_every: 100,
            max_identifier_len: 100,
        }
    }
}

impl ServerConfig {
    /// Config for testing (ephemeral port left to the caller, fast sweep).
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            room: RoomConfig::for_testing(),
            sweep_interval: Duration::from_millis(20),
            snapshot_every: 5,
            ..Self::default()
        }
    }

    /// Build a config from `LOGOS_SYNC_*` environment variables, falling back to defaults.
    ///
    /// - `LOGOS_SYNC_BIND`: bind address
    /// - `LOGOS_SYNC_MAX_PARTICIPANTS`: participant cap per room
    /// - `LOGOS_SYNC_ROOM_TTL_SECS`: empty-room ttl in seconds
    /// - `LOGOS_SYNC_SWEEP_SECS`: sweep interval in seconds
    /// - `LOGOS_SYNC_SNAPSHOT_EVERY`: operations between snapshots
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LOGOS_SYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(max) = env_parse::<usize>("LOGOS_SYNC_MAX_PARTICIPANTS") {
            config.room.max_participants = max;
        }
        if let Some(secs) = env_parse::<u64>("LOGOS_SYNC_ROOM_TTL_SECS") {
            config.room.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LOGOS_SYNC_SWEEP_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(every) = env_parse::<u64>("LOGOS_SYNC_SNAPSHOT_EVERY") {
            config.snapshot_every = every;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring unparsable {key}={raw}");
                None
            }
        },
        Err(_) => None,
    }
}
