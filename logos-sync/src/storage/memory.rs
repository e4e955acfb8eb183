//! In-process [`Persistence`] backend.
//!
//! Snapshots are LZ4-compressed; operations are bincode-encoded and keyed by
//! version so replays are idempotent. Saving a snapshot compacts away the
//! operations it covers.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{Persistence, SnapshotMetadata};
use crate::document::Snapshot;
use crate::error::StoreError;
use crate::operation::Operation;
use crate::presence::Cursor;

/// A compressed document snapshot.
#[derive(Debug, Clone)]
struct StoredSnapshot {
    version: u64,
    /// Uncompressed size in bytes
    original_size: u32,
    /// LZ4 block with prepended size
    compressed: Vec<u8>,
    metadata: SnapshotMetadata,
}

impl StoredSnapshot {
    fn compress(snapshot: &Snapshot, metadata: &SnapshotMetadata) -> Self {
        let bytes = snapshot.content.as_bytes();
        Self {
            version: snapshot.version,
            original_size: bytes.len() as u32,
            compressed: lz4_flex::compress_prepend_size(bytes),
            metadata: metadata.clone(),
        }
    }

    fn decompress(&self) -> Result<Snapshot, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::DecompressionFailed(e.to_string()))?;
        let content =
            String::from_utf8(bytes).map_err(|e| StoreError::DecompressionFailed(e.to_string()))?;
        Ok(Snapshot {
            version: self.version,
            content,
        })
    }
}

#[derive(Debug, Default)]
struct RoomRecord {
    snapshot: Option<StoredSnapshot>,
    /// version → bincode-encoded operation
    operations: BTreeMap<u64, Vec<u8>>,
    /// (userId, clientId) → last cursor
    cursors: HashMap<(String, String), Cursor>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub rooms: usize,
    pub snapshots: usize,
    pub operations: usize,
    /// Total compressed snapshot bytes
    pub snapshot_bytes: usize,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, RoomRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved cursor for one client of a user.
    pub fn cursor_state(&self, room_id: &str, user_id: &str, client_id: &str) -> Option<Cursor> {
        let rooms = self.rooms.read().ok()?;
        rooms
            .get(room_id)?
            .cursors
            .get(&(user_id.to_string(), client_id.to_string()))
            .copied()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut stats = StoreStats {
            rooms: rooms.len(),
            ..StoreStats::default()
        };
        for record in rooms.values() {
            stats.operations += record.operations.len();
            if let Some(snapshot) = &record.snapshot {
                stats.snapshots += 1;
                stats.snapshot_bytes += snapshot.compressed.len();
            }
        }
        Ok(stats)
    }
}

fn encode_operation(op: &Operation) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(op, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_operation(bytes: &[u8]) -> Result<Operation, StoreError> {
    let (op, _): (Operation, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(op)
}

impl Persistence for MemoryStore {
    fn save_operation(&self, room_id: &str, op: &Operation) -> Result<(), StoreError> {
        let encoded = encode_operation(op)?;
        let mut rooms = self.rooms.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = rooms.entry(room_id.to_string()).or_default();
        if record.snapshot.as_ref().is_some_and(|s| s.version >= op.version) {
            return Ok(());
        }
        record.operations.insert(op.version, encoded);
        Ok(())
    }

    fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &Snapshot,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError> {
        let stored = StoredSnapshot::compress(snapshot, metadata);
        let mut rooms = self.rooms.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = rooms.entry(room_id.to_string()).or_default();
        if record.snapshot.as_ref().is_some_and(|s| s.version > snapshot.version) {
            log::debug!(
                "Ignoring stale snapshot for room {room_id} at version {}",
                snapshot.version
            );
            return Ok(());
        }
        record.operations = record.operations.split_off(&(snapshot.version + 1));
        log::debug!(
            "Saved snapshot for room {room_id} at version {} ({} -> {} bytes)",
            snapshot.version,
            stored.original_size,
            stored.compressed.len()
        );
        record.snapshot = Some(stored);
        Ok(())
    }

    fn get_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::LockPoisoned)?;
        match rooms.get(room_id).and_then(|r| r.snapshot.as_ref()) {
            Some(stored) => stored.decompress().map(Some),
            None => Ok(None),
        }
    }

    fn get_operations_since(&self, room_id: &str, from_version: u64) -> Result<Vec<Operation>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::LockPoisoned)?;
        let Some(record) = rooms.get(room_id) else {
            return Ok(Vec::new());
        };
        record
            .operations
            .range(from_version + 1..)
            .map(|(_, bytes)| decode_operation(bytes))
            .collect()
    }

    fn save_cursor_state(
        &self,
        room_id: &str,
        user_id: &str,
        client_id: &str,
        cursor: Cursor,
    ) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| StoreError::LockPoisoned)?;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .cursors
            .insert((user_id.to_string(), client_id.to_string()), cursor);
        Ok(())
    }

    fn delete_room_data(&self, room_id: &str) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| StoreError::LockPoisoned)?;
        rooms.remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(id: &str, version: u64, pos: usize, text: &str) -> Operation {
        let mut op = Operation::insert(id, "c1", version - 1, pos, text);
        op.version = version;
        op
    }

    #[test]
    fn test_snapshot_roundtrip_compressed() {
        let store = MemoryStore::new();
        let content = "fn main() {}\n".repeat(200);
        let snapshot = Snapshot { version: 7, content: content.clone() };
        store.save_snapshot("r1", &snapshot, &SnapshotMetadata::now(7)).unwrap();

        assert_eq!(store.get_snapshot("r1").unwrap(), Some(snapshot));
        let stats = store.stats().unwrap();
        assert_eq!(stats.snapshots, 1);
        assert!(stats.snapshot_bytes < content.len());
    }

    #[test]
    fn test_missing_room() {
        let store = MemoryStore::new();
        assert_eq!(store.get_snapshot("none").unwrap(), None);
        assert!(store.get_operations_since("none", 0).unwrap().is_empty());
    }

    #[test]
    fn test_operations_since_in_order() {
        let store = MemoryStore::new();
        store.save_operation("r1", &applied("b", 2, 1, "b")).unwrap();
        store.save_operation("r1", &applied("a", 1, 0, "a")).unwrap();
        store.save_operation("r1", &applied("c", 3, 2, "c")).unwrap();

        let ops = store.get_operations_since("r1", 1).unwrap();
        let ids: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!((ops[0].position, ops[0].content.as_str(), ops[0].version), (1, "b", 2));
    }

    #[test]
    fn test_resaving_operation_is_idempotent() {
        let store = MemoryStore::new();
        let op = applied("a", 1, 0, "a");
        store.save_operation("r1", &op).unwrap();
        store.save_operation("r1", &op).unwrap();
        assert_eq!(store.get_operations_since("r1", 0).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_compacts_operations() {
        let store = MemoryStore::new();
        for v in 1..=5 {
            store.save_operation("r1", &applied(&format!("op{v}"), v, 0, "x")).unwrap();
        }
        store
            .save_snapshot("r1", &Snapshot { version: 3, content: "xxx".into() }, &SnapshotMetadata::now(3))
            .unwrap();
        let rest = store.get_operations_since("r1", 0).unwrap();
        assert_eq!(rest.iter().map(|o| o.version).collect::<Vec<_>>(), vec![4, 5]);

        // Late write for a version the snapshot already covers
        store.save_operation("r1", &applied("late", 2, 0, "x")).unwrap();
        assert_eq!(store.stats().unwrap().operations, 2);

        // Older snapshot never replaces a newer one
        store
            .save_snapshot("r1", &Snapshot { version: 1, content: "x".into() }, &SnapshotMetadata::now(1))
            .unwrap();
        assert_eq!(store.get_snapshot("r1").unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_cursor_state_and_delete() {
        let store = MemoryStore::new();
        store.save_cursor_state("r1", "alice", "c1", Cursor::new(4, 2)).unwrap();
        assert_eq!(store.cursor_state("r1", "alice", "c1"), Some(Cursor::new(4, 2)));
        assert_eq!(store.cursor_state("r1", "alice", "c2"), None);

        store.delete_room_data("r1").unwrap();
        assert_eq!(store.cursor_state("r1", "alice", "c1"), None);
        assert_eq!(store.stats().unwrap().rooms, 0);
    }
}
