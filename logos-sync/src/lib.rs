//! # logos-sync — Operational-transformation sync core for Logos
//!
//! Lets many editors mutate one shared text document concurrently and
//! converge on identical content.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WebSocket   ┌──────────────────────────────┐
//! │ Editor      │ ◄─────────────────────► │ SyncServer                   │
//! │ (per user)  │                         │   └── CollabHub              │
//! └─────────────┘                         │        ├── RoomManager       │
//!                                         │        │    └── Room         │
//!                                         │        │         ├ presence  │
//!                                         │        │         └ limiter   │
//!                                         │        ├── OtEngine          │
//!                                         │        │    └── DocumentState│
//!                                         │        └── PersistenceWriter │
//!                                         └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Edit operations and pairwise transform rules
//! - [`document`] — Per-room document state and the OT engine
//! - [`limiter`] — Sliding-window rate limiting with room-wide backpressure
//! - [`presence`] — Cursor and activity tracking
//! - [`room`] — Connection registry for one room
//! - [`manager`] — Room lifecycle, indices and expiry sweep
//! - [`protocol`] — Wire messages and validation
//! - [`storage`] — Persistence backend and background writer
//! - [`hub`] — Message dispatch
//! - [`server`] — WebSocket transport

pub mod config;
pub mod error;
pub mod operation;
pub mod document;
pub mod limiter;
pub mod presence;
pub mod room;
pub mod manager;
pub mod protocol;
pub mod storage;
pub mod hub;
pub mod server;

// Re-exports for convenience
pub use config::{EngineConfig, RoomConfig, ServerConfig};
pub use error::{codes, OtError, RoomError, StoreError, ValidationError, WireError};
pub use operation::{transform, transform_against, OpKind, Operation};
pub use document::{ApplyResult, DocumentState, OtEngine, QueueStats, Snapshot};
pub use limiter::{RateDecision, RateLimiter};
pub use presence::{Cursor, Participant, UserPresence};
pub use room::{BroadcastTarget, ChannelHandle, ConnectionHandle, JoinOutcome, LeaveOutcome, Room, RoomMetrics};
pub use manager::{ManagerStats, RoomManager};
pub use protocol::{ClientMessage, MessageValidator, ProtocolError, ServerMessage, WireOperation};
pub use storage::{MemoryStore, Persistence, PersistenceWriter, SnapshotMetadata};
pub use hub::{CollabHub, Connection, Dispatch, HubStats, SweepReport};
pub use server::{ServerStats, SyncServer};

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
