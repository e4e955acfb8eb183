//! Persistence for room documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   fire-and-forget   ┌───────────────────┐      ┌─────────────┐
//! │ CollabHub   │ ──────────────────► │ PersistenceWriter │ ───► │ Persistence │
//! │ (hot path)  │   mpsc commands     │ (tokio task)      │      │ (MemoryStore│
//! └──────┬──────┘                     └───────────────────┘      │  or other)  │
//!        │ first reference to a room                             └──────┬──────┘
//!        └───────────── snapshot + operations since ◄─────────────────────┘
//! ```
//!
//! Writes never block or roll back the in-memory document; failures are
//! logged and dropped. Operations are keyed by version, so a retried write
//! replaces rather than duplicates.

pub mod memory;
pub mod writer;

pub use memory::{MemoryStore, StoreStats};
pub use writer::{PersistCommand, PersistenceWriter};

use serde::{Deserialize, Serialize};

use crate::document::Snapshot;
use crate::error::StoreError;
use crate::operation::Operation;
use crate::presence::Cursor;

/// Extra data stored alongside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
    /// Operations held in memory when the snapshot was taken
    pub history_len: usize,
}

impl SnapshotMetadata {
    pub fn now(history_len: usize) -> Self {
        Self {
            saved_at: crate::now_millis(),
            history_len,
        }
    }
}

/// Durable storage backend.
///
/// Implementations must be cheap to call from the writer task and safe to
/// share across threads.
pub trait Persistence: Send + Sync {
    /// Store an applied operation under its assigned version.
    fn save_operation(&self, room_id: &str, op: &Operation) -> Result<(), StoreError>;

    /// Store a snapshot and drop operations it already covers.
    fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &Snapshot,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError>;

    fn get_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Stored operations with version `> from_version`, oldest first.
    fn get_operations_since(&self, room_id: &str, from_version: u64) -> Result<Vec<Operation>, StoreError>;

    fn save_cursor_state(
        &self,
        room_id: &str,
        user_id: &str,
        client_id: &str,
        cursor: Cursor,
    ) -> Result<(), StoreError>;

    fn delete_room_data(&self, room_id: &str) -> Result<(), StoreError>;
}
