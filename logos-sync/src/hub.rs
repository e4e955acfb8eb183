//! Dispatch boundary: validated frames in, outbound deliveries out.
//!
//! ```text
//! text frame ─► MessageValidator ─► ClientMessage ─► match ─┬─► RoomManager (join/leave/cursor/presence)
//!                                                           └─► OtEngine    (ops/acks/sync)
//!                                                                   │
//!             Dispatch { replies, broadcasts } ◄───────────────────┘
//!                     │
//!                     └─► deliver() after the hub lock is released
//! ```
//!
//! All state changes for one frame happen inside a single `&mut self` call,
//! so a broadcast always reflects a fully applied operation. Persistence is
//! queued on the background writer and never awaited while handling a frame.
//!
//! A swept document leaves memory in two steps: its snapshot is queued
//! behind a writer barrier, and a later sweep drops it once the barrier has
//! resolved. Anything not in memory is therefore fully in the store, and a
//! restore can read the store directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::document::{DocumentState, OtEngine, Snapshot};
use crate::error::{codes, RoomError, StoreError};
use crate::manager::{ManagerStats, RoomManager};
use crate::presence::{Cursor, UserPresence};
use crate::protocol::{ClientMessage, MessageValidator, ServerMessage, WireOperation};
use crate::room::{BroadcastTarget, ConnectionHandle};
use crate::storage::{Persistence, PersistenceWriter, SnapshotMetadata};

/// One transport connection as seen by the hub.
#[derive(Clone)]
pub struct Connection {
    pub id: Uuid,
    pub handle: Arc<dyn ConnectionHandle>,
}

impl Connection {
    pub fn new(handle: Arc<dyn ConnectionHandle>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle,
        }
    }
}

/// A message and the connections that should receive it.
#[derive(Debug)]
pub struct Outbound {
    pub targets: Vec<BroadcastTarget>,
    pub message: ServerMessage,
}

/// Everything one inbound frame produced.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// For the sending connection only
    pub replies: Vec<ServerMessage>,
    pub broadcasts: Vec<Outbound>,
}

impl Dispatch {
    fn reply(message: ServerMessage) -> Self {
        Self {
            replies: vec![message],
            broadcasts: Vec::new(),
        }
    }

    fn broadcast(&mut self, targets: Vec<BroadcastTarget>, message: ServerMessage) {
        if !targets.is_empty() {
            self.broadcasts.push(Outbound { targets, message });
        }
    }

    fn merge(&mut self, other: Dispatch) {
        self.replies.extend(other.replies);
        self.broadcasts.extend(other.broadcasts);
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty() && self.broadcasts.is_empty()
    }

    /// Encode each message once and queue it on every recipient.
    ///
    /// Returns the number of frames queued.
    pub fn deliver(self, reply_to: &dyn ConnectionHandle) -> usize {
        let mut queued = 0;
        for message in &self.replies {
            if let Some(frame) = encode_frame(message) {
                queued += usize::from(reply_to.send(frame));
            }
        }
        for outbound in &self.broadcasts {
            let Some(frame) = encode_frame(&outbound.message) else {
                continue;
            };
            for target in &outbound.targets {
                if target.handle.send(Arc::clone(&frame)) {
                    queued += 1;
                } else {
                    log::debug!("Dropped {} frame for closed client {}", outbound.message.type_name(), target.client_id);
                }
            }
        }
        queued
    }
}

fn encode_frame(message: &ServerMessage) -> Option<Arc<str>> {
    match message.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode {} frame: {e}", message.type_name());
            None
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired rooms removed from the manager
    pub rooms: Vec<String>,
    /// Documents dropped from memory
    pub documents: Vec<String>,
    /// Documents snapshotted this sweep, dropped once the writer confirms
    pub draining: Vec<String>,
}

/// Documents waiting for the writer to confirm their final snapshot.
struct Eviction {
    /// (roomId, version snapshotted)
    rooms: Vec<(String, u64)>,
    confirmed: oneshot::Receiver<()>,
    failed_before: u64,
}

/// Hub statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub manager: ManagerStats,
    pub documents: usize,
    pub idle_documents: usize,
    pub draining_documents: usize,
    pub persisted_writes: u64,
    pub failed_writes: u64,
}

/// Owns the room manager, the OT engine and the persistence queue.
pub struct CollabHub {
    manager: RoomManager,
    engine: OtEngine,
    validator: MessageValidator,
    persistence: Option<PersistenceWriter>,
    /// Snapshot every N versions (0 = only on close)
    snapshot_every: u64,
    /// (roomId, clientId) → connection that joined it
    bindings: HashMap<(String, String), Uuid>,
    /// Documents whose room emptied, and when
    idle_documents: HashMap<String, Instant>,
    evictions: Vec<Eviction>,
    document_ttl: Duration,
}

impl CollabHub {
    pub fn new(config: &ServerConfig, persistence: Option<PersistenceWriter>) -> Self {
        Self {
            manager: RoomManager::new(config.room.clone()),
            engine: OtEngine::new(config.engine.clone()),
            validator: MessageValidator::from_config(config),
            persistence,
            snapshot_every: config.snapshot_every,
            bindings: HashMap::new(),
            idle_documents: HashMap::new(),
            evictions: Vec::new(),
            document_ttl: config.room.ttl,
        }
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    pub fn engine(&self) -> &OtEngine {
        &self.engine
    }

    /// Validate and dispatch one text frame.
    pub fn handle_frame(&mut self, conn: &Connection, raw: &str) -> Dispatch {
        match self.validator.validate(raw) {
            Ok(message) => self.dispatch(conn, message),
            Err(e) => {
                log::warn!("Rejected frame from connection {}: {e}", conn.id);
                Dispatch::reply(self.validator.build_error_message(&e, None, None))
            }
        }
    }

    /// Dispatch an already validated message.
    pub fn dispatch(&mut self, conn: &Connection, message: ClientMessage) -> Dispatch {
        if !matches!(message, ClientMessage::JoinRoom { .. })
            && !self.is_bound(conn, message.room_id(), message.client_id())
        {
            let err = RoomError::NotInRoom {
                room_id: message.room_id().to_string(),
                client_id: message.client_id().to_string(),
            };
            log::warn!("{} from connection {}: {err}", message.type_name(), conn.id);
            return Dispatch::reply(self.validator.build_error_message(
                &err,
                Some(message.room_id()),
                Some(message.client_id()),
            ));
        }

        match message {
            ClientMessage::JoinRoom { room_id, user_id, client_id } => {
                self.join(conn, &room_id, &user_id, &client_id)
            }
            ClientMessage::LeaveRoom { room_id, client_id } => self.leave(&room_id, &client_id),
            ClientMessage::OtOp { room_id, client_id, operation } => {
                self.submit(&room_id, &client_id, operation)
            }
            ClientMessage::CursorUpdate { room_id, client_id, cursor } => {
                self.move_cursor(&room_id, &client_id, cursor)
            }
            ClientMessage::SyncState { room_id, client_id, from_version } => {
                self.sync(&room_id, &client_id, from_version)
            }
            ClientMessage::Ack { room_id, client_id, operation_id } => {
                self.engine.acknowledge_operation(&room_id, &client_id, &operation_id);
                if let Some(room) = self.manager.get_room_mut(&room_id) {
                    room.update_activity(&client_id);
                }
                Dispatch::default()
            }
            ClientMessage::PresenceUpdate { room_id, client_id } => {
                let Some(room) = self.manager.get_room_mut(&room_id) else {
                    return Dispatch::default();
                };
                room.update_activity(&client_id);
                let mut out = Dispatch::default();
                out.broadcast(
                    room.broadcast(None),
                    ServerMessage::PresenceUpdate {
                        room_id,
                        participants: room.participants(),
                    },
                );
                out
            }
        }
    }

    fn is_bound(&self, conn: &Connection, room_id: &str, client_id: &str) -> bool {
        self.bindings
            .get(&(room_id.to_string(), client_id.to_string()))
            .is_some_and(|id| *id == conn.id)
    }

    fn join(&mut self, conn: &Connection, room_id: &str, user_id: &str, client_id: &str) -> Dispatch {
        self.ensure_document(room_id);

        let outcome = match self.manager.join_room(
            room_id,
            client_id,
            Arc::clone(&conn.handle),
            user_id,
            None,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Join refused for {client_id}: {e}");
                return Dispatch::reply(self.validator.build_error_message(
                    &e,
                    Some(room_id),
                    Some(client_id),
                ));
            }
        };

        let key = (room_id.to_string(), client_id.to_string());
        if let Some(previous) = self.bindings.insert(key, conn.id) {
            if previous != conn.id {
                log::info!("Client {client_id} in room {room_id} moved to connection {}", conn.id);
            }
        }
        self.idle_documents.remove(room_id);

        let Some(room) = self.manager.get_room(room_id) else {
            return Dispatch::default();
        };
        let snapshot = self.engine.get_snapshot(room_id);
        let mut out = Dispatch::reply(ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            version: snapshot.version,
            content: snapshot.content,
            participants: room.participants(),
        });
        if !outcome.rejoined {
            if let Some(participant) = room.presence_of(client_id).map(UserPresence::participant) {
                out.broadcast(
                    room.broadcast(Some(client_id)),
                    ServerMessage::UserJoined {
                        room_id: room_id.to_string(),
                        participant,
                        participant_count: outcome.participant_count,
                    },
                );
            }
        }
        out
    }

    fn leave(&mut self, room_id: &str, client_id: &str) -> Dispatch {
        let presence = self
            .manager
            .get_room(room_id)
            .and_then(|room| room.presence_of(client_id))
            .cloned();
        let outcome = self.manager.leave_room(room_id, client_id);
        self.bindings
            .remove(&(room_id.to_string(), client_id.to_string()));
        let Some(presence) = presence.filter(|_| outcome.success) else {
            return Dispatch::default();
        };

        if let Some(writer) = &self.persistence {
            writer.save_cursor_state(room_id, &presence.user_id, client_id, presence.cursor);
        }

        let mut out = Dispatch::default();
        if outcome.is_empty {
            self.idle_documents.insert(room_id.to_string(), Instant::now());
            self.persist_snapshot(room_id);
        } else if let Some(room) = self.manager.get_room(room_id) {
            out.broadcast(
                room.broadcast(None),
                ServerMessage::UserLeft {
                    room_id: room_id.to_string(),
                    user_id: presence.user_id,
                    client_id: client_id.to_string(),
                    participant_count: outcome.participant_count,
                },
            );
        }
        out
    }

    fn submit(&mut self, room_id: &str, client_id: &str, wire: WireOperation) -> Dispatch {
        self.ensure_document(room_id);

        let Some(room) = self.manager.get_room_mut(room_id) else {
            return Dispatch::default();
        };
        let decision = room.apply_rate_limit(client_id);
        if let (Some(code), Some(reason)) = (decision.code(), decision.reason()) {
            return Dispatch::reply(ServerMessage::error(code, reason, Some(room_id), Some(client_id)));
        }

        let user_id = room.user_of(client_id).unwrap_or(client_id).to_string();
        let op = wire.into_operation(client_id, &user_id);
        let operation_id = op.id.clone();

        let result = match self.engine.apply_operation(room_id, op) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Room {room_id}: operation {operation_id} from {client_id} rejected: {e}");
                return Dispatch::reply(self.validator.build_error_message(
                    &e,
                    Some(room_id),
                    Some(client_id),
                ));
            }
        };

        let ack = self
            .validator
            .build_ack_message(room_id, client_id, &operation_id, result.version);
        if result.duplicate {
            log::debug!("Room {room_id}: duplicate operation {operation_id} from {client_id}");
            return Dispatch::reply(ack);
        }

        room.update_activity(client_id);
        let targets = room.broadcast(Some(client_id));

        if let Some(writer) = &self.persistence {
            writer.save_operation(room_id, result.applied.clone());
            if self.snapshot_every > 0 && result.version % self.snapshot_every == 0 {
                let history_len = self.engine.document(room_id).map_or(0, |d| d.history().len());
                writer.save_snapshot(
                    room_id,
                    Snapshot {
                        version: result.version,
                        content: result.content.clone(),
                    },
                    SnapshotMetadata::now(history_len),
                );
            }
        }

        let mut out = Dispatch::reply(ack);
        out.broadcast(
            targets,
            ServerMessage::OtOp {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
                version: result.version,
                operation: result.applied,
            },
        );
        out
    }

    fn move_cursor(&mut self, room_id: &str, client_id: &str, cursor: Cursor) -> Dispatch {
        let Some(room) = self.manager.get_room_mut(room_id) else {
            return Dispatch::default();
        };
        if !room.update_cursor(client_id, cursor) {
            log::warn!("Room {room_id}: ignoring cursor update from departed client {client_id}");
            return Dispatch::default();
        }
        let user_id = room.user_of(client_id).unwrap_or(client_id).to_string();
        if let Some(writer) = &self.persistence {
            writer.save_cursor_state(room_id, &user_id, client_id, cursor);
        }

        let mut out = Dispatch::default();
        out.broadcast(
            room.broadcast(Some(client_id)),
            ServerMessage::CursorUpdate {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
                user_id,
                cursor,
            },
        );
        out
    }

    fn sync(&mut self, room_id: &str, client_id: &str, from_version: Option<u64>) -> Dispatch {
        self.ensure_document(room_id);
        if let Some(room) = self.manager.get_room_mut(room_id) {
            room.update_activity(client_id);
        }
        let Some(doc) = self.engine.document(room_id) else {
            return Dispatch::default();
        };

        let message = match from_version.and_then(|from| doc.operations_since(client_id, from)) {
            Some(operations) => ServerMessage::SyncState {
                room_id: room_id.to_string(),
                version: doc.version(),
                content: None,
                operations,
            },
            None => ServerMessage::SyncState {
                room_id: room_id.to_string(),
                version: doc.version(),
                content: Some(doc.content().to_string()),
                operations: Vec::new(),
            },
        };
        Dispatch::reply(message)
    }

    /// Leave every room a closed connection had joined.
    pub fn disconnect(&mut self, conn_id: Uuid) -> Dispatch {
        let mut joined: Vec<(String, String)> = self
            .bindings
            .iter()
            .filter(|(_, id)| **id == conn_id)
            .map(|(key, _)| key.clone())
            .collect();
        joined.sort();

        let mut out = Dispatch::default();
        for (room_id, client_id) in joined {
            log::info!("Connection {conn_id} closed; removing {client_id} from {room_id}");
            out.merge(self.leave(&room_id, &client_id));
        }
        out
    }

    /// Make sure a document exists, restoring it from persistence on first reference.
    fn ensure_document(&mut self, room_id: &str) {
        if self.engine.has_document(room_id) {
            return;
        }
        let Some(writer) = &self.persistence else {
            self.engine.get_document_state(room_id);
            return;
        };

        match restore_document(writer.store().as_ref(), room_id) {
            Ok(Some(state)) => {
                if let Err(e) = self.engine.restore_document_state(state) {
                    log::error!("Failed to install restored document {room_id}: {e}");
                }
            }
            Ok(None) => {
                self.engine.get_document_state(room_id);
            }
            Err(e) => {
                log::error!("Failed to restore room {room_id}, starting empty: {e}");
                self.engine.get_document_state(room_id);
            }
        }
    }

    fn persist_snapshot(&self, room_id: &str) {
        let (Some(writer), Some(doc)) = (&self.persistence, self.engine.document(room_id)) else {
            return;
        };
        writer.save_snapshot(room_id, doc.snapshot(), SnapshotMetadata::now(doc.history().len()));
    }

    /// Remove expired rooms and evict documents idle past the room ttl.
    ///
    /// Without persistence a document is dropped at once. Otherwise it is
    /// snapshotted now and dropped by a later sweep, after the writer has
    /// confirmed every write queued for it.
    pub fn sweep(&mut self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> SweepReport {
        let rooms = self.manager.cleanup_expired_rooms_at(now);
        let mut documents = self.finish_evictions(now);

        let mut candidates: Vec<String> = rooms
            .iter()
            .filter(|id| self.engine.has_document(id))
            .cloned()
            .collect();
        candidates.extend(
            self.idle_documents
                .iter()
                .filter(|(id, since)| {
                    now.saturating_duration_since(**since) > self.document_ttl
                        && self.manager.get_room(id).is_none()
                })
                .map(|(id, _)| id.clone()),
        );
        candidates.sort();
        candidates.dedup();

        let mut draining = Vec::new();
        for room_id in candidates {
            self.idle_documents.remove(&room_id);
            if self.persistence.is_none() {
                if self.engine.cleanup_room(&room_id).is_some() {
                    documents.push(room_id);
                }
            } else if let Some(version) = self.engine.document(&room_id).map(DocumentState::version) {
                self.persist_snapshot(&room_id);
                draining.push((room_id, version));
            }
        }
        let draining_ids: Vec<String> = draining.iter().map(|(id, _)| id.clone()).collect();
        if let (Some(writer), false) = (&self.persistence, draining.is_empty()) {
            let failed_before = writer.failed();
            match writer.barrier() {
                Ok(confirmed) => self.evictions.push(Eviction {
                    rooms: draining,
                    confirmed,
                    failed_before,
                }),
                Err(e) => log::error!("Keeping {} documents in memory: {e}", draining_ids.len()),
            }
        }
        documents.sort();

        if !rooms.is_empty() || !documents.is_empty() || !draining_ids.is_empty() {
            log::info!(
                "Sweep removed {} rooms and {} documents, {} documents draining",
                rooms.len(),
                documents.len(),
                draining_ids.len()
            );
        }
        SweepReport {
            rooms,
            documents,
            draining: draining_ids,
        }
    }

    /// Drop documents whose final snapshot the writer has confirmed.
    fn finish_evictions(&mut self, now: Instant) -> Vec<String> {
        let failed_now = self.persistence.as_ref().map_or(0, PersistenceWriter::failed);
        let mut evicted = Vec::new();
        let mut waiting = Vec::new();

        for mut eviction in std::mem::take(&mut self.evictions) {
            match eviction.confirmed.try_recv() {
                Err(TryRecvError::Empty) => waiting.push(eviction),
                Err(TryRecvError::Closed) => {
                    log::error!(
                        "Persistence writer gone; keeping {} documents in memory",
                        eviction.rooms.len()
                    );
                }
                Ok(()) if failed_now > eviction.failed_before => {
                    log::warn!(
                        "Writes failed while draining {} documents; retrying next sweep",
                        eviction.rooms.len()
                    );
                    let overdue = now.checked_sub(self.document_ttl).unwrap_or(now);
                    for (room_id, _) in eviction.rooms {
                        if self.manager.get_room(&room_id).is_none() {
                            self.idle_documents.entry(room_id).or_insert(overdue);
                        }
                    }
                }
                Ok(()) => {
                    for (room_id, version) in eviction.rooms {
                        if !self.is_evictable(&room_id, version) {
                            continue;
                        }
                        if self.engine.cleanup_room(&room_id).is_some() {
                            evicted.push(room_id);
                        }
                    }
                }
            }
        }
        self.evictions = waiting;
        evicted
    }

    /// Unused since the snapshot at `version` was queued.
    fn is_evictable(&self, room_id: &str, version: u64) -> bool {
        self.manager.get_room(room_id).is_none()
            && !self.idle_documents.contains_key(room_id)
            && self.engine.document(room_id).is_some_and(|doc| doc.version() == version)
    }

    /// Wait for every queued persistence write. Never called while handling frames.
    pub async fn flush_persistence(&self) -> Result<(), StoreError> {
        match &self.persistence {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// Spawn the periodic sweep and hand its task to the room manager.
    ///
    /// The task holds a weak reference, so dropping the hub ends it.
    pub async fn start_sweeper(hub: &Arc<Mutex<CollabHub>>, interval: Duration) {
        let weak: Weak<Mutex<CollabHub>> = Arc::downgrade(hub);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = weak.upgrade() else {
                    break;
                };
                let report = hub.lock().await.sweep();
                log::debug!("Sweep tick: {report:?}");
            }
        });
        hub.lock().await.manager.attach_sweeper(task);
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            manager: self.manager.get_stats(),
            documents: self.engine.document_count(),
            idle_documents: self.idle_documents.len(),
            draining_documents: self.evictions.iter().map(|e| e.rooms.len()).sum(),
            persisted_writes: self.persistence.as_ref().map_or(0, PersistenceWriter::written),
            failed_writes: self.persistence.as_ref().map_or(0, PersistenceWriter::failed),
        }
    }

    /// Stop the sweep, snapshot every document and drain the writer.
    pub async fn shutdown(&mut self) {
        self.manager.shutdown();
        let room_ids: Vec<String> = self.engine.documents().map(|d| d.room_id().to_string()).collect();
        for room_id in &room_ids {
            self.persist_snapshot(room_id);
        }
        if let Some(writer) = self.persistence.take() {
            writer.shutdown().await;
        }
        log::info!("Hub shut down ({} documents snapshotted)", room_ids.len());
    }
}

/// Rebuild a document from its last snapshot plus the operations after it.
fn restore_document(store: &dyn Persistence, room_id: &str) -> Result<Option<DocumentState>, StoreError> {
    let snapshot = store.get_snapshot(room_id)?;
    let from_version = snapshot.as_ref().map_or(0, |s| s.version);
    let operations = store.get_operations_since(room_id, from_version)?;
    if snapshot.is_none() && operations.is_empty() {
        return Ok(None);
    }

    let mut state = match snapshot {
        Some(s) => DocumentState::restored(room_id, s.version, s.content),
        None => DocumentState::new(room_id, ""),
    };
    let replayed = operations.len();
    for op in operations {
        let version = op.version;
        if let Err(e) = state.replay(op) {
            log::error!("Room {room_id}: stopping replay at version {version}: {e}");
            break;
        }
    }
    log::info!(
        "Restored room {room_id} at version {} ({replayed} operations replayed)",
        state.version()
    );
    Ok(Some(state))
}
