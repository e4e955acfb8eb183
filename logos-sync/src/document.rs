//! Document state and the operational transformation engine.
//!
//! Each room id maps to one [`DocumentState`]: the current text, its version
//! and the ordered history of applied operations. An incoming operation
//! authored against version `v` is transformed against every history entry
//! with version `> v` (in applied order) and then spliced into the text at
//! the next version.
//!
//! Invariant: `content` equals the seed (or restored snapshot) with
//! `history` applied in order, and `version == base_version + history.len()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{OtError, ValidationError};
use crate::operation::{self, char_len, OpKind, Operation};

/// Result of applying (or re-submitting) an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Version the operation produced
    pub version: u64,
    /// Document text after the operation
    pub content: String,
    /// The operation as applied: transformed position/content, assigned version
    pub applied: Operation,
    /// The operation id had already been applied; nothing changed
    pub duplicate: bool,
}

/// Version + full text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub content: String,
}

/// Pending-queue statistics for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub client_count: usize,
    pub total_pending: usize,
    pub max_queue_length: usize,
}

/// Authoritative state of one room's document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    room_id: String,
    version: u64,
    /// Version of the seed/snapshot `history` starts from
    base_version: u64,
    content: String,
    content_chars: usize,
    history: Vec<Operation>,
    /// clientId → applied operations awaiting acknowledgment, oldest first
    pending: HashMap<String, Vec<Operation>>,
    /// (clientId, operationId) → assigned version
    applied_ids: HashMap<(String, String), u64>,
}

impl DocumentState {
    pub fn new(room_id: impl Into<String>, seed: impl Into<String>) -> Self {
        Self::restored(room_id, 0, seed)
    }

    /// State restored from a snapshot taken at `version`.
    pub fn restored(room_id: impl Into<String>, version: u64, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            room_id: room_id.into(),
            version,
            base_version: version,
            content_chars: char_len(&content),
            content,
            history: Vec::new(),
            pending: HashMap::new(),
            applied_ids: HashMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            content: self.content.clone(),
        }
    }

    /// Whether the in-memory history can serve every operation after `from_version`.
    pub fn covers(&self, from_version: u64) -> bool {
        from_version >= self.base_version && from_version <= self.version
    }

    /// Document length (chars) as it was at `version`.
    fn length_at(&self, version: u64) -> Option<usize> {
        if !self.covers(version) {
            return None;
        }
        let newer = &self.history[(version - self.base_version) as usize..];
        let delta: i64 = newer.iter().map(Operation::length_delta).sum();
        usize::try_from(self.content_chars as i64 - delta).ok()
    }

    /// Transform `op` against concurrent history and apply it.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyResult, OtError> {
        let key = (op.client_id.clone(), op.id.clone());
        if let Some(&version) = self.applied_ids.get(&key) {
            return Ok(self.duplicate_result(version));
        }

        if op.version > self.version {
            return Err(ValidationError::new(
                "version",
                format!("{} is ahead of document version {}", op.version, self.version),
            )
            .into());
        }
        let Some(len_then) = self.length_at(op.version) else {
            return Err(ValidationError::new(
                "version",
                format!("{} predates retained history (from {})", op.version, self.base_version),
            )
            .into());
        };
        let in_bounds = op.position <= len_then
            && match op.kind {
                OpKind::Insert => true,
                OpKind::Delete => op.checked_end().is_some_and(|end| end <= len_then),
            };
        if !in_bounds {
            return Err(ValidationError::new(
                "position",
                format!(
                    "{} at {} (+{} chars) outside document of length {len_then} at version {}",
                    op.kind.as_str(),
                    op.position,
                    op.len(),
                    op.version
                ),
            )
            .into());
        }

        let concurrent = &self.history[(op.version - self.base_version) as usize..];
        let mut transformed = operation::transform_against(&op, concurrent);
        if transformed.position != op.position || transformed.content != op.content {
            log::debug!(
                "Room {}: transformed {} from {} against {} ops: {}@{} -> {}@{}",
                self.room_id,
                op.id,
                op.client_id,
                concurrent.len(),
                op.kind.as_str(),
                op.position,
                transformed.kind.as_str(),
                transformed.position
            );
        }

        self.splice(&mut transformed).map_err(|detail| {
            log::error!(
                "Room {}: dropping operation {} from {}: {detail}",
                self.room_id,
                op.id,
                op.client_id
            );
            OtError::TransformInvariant {
                room_id: self.room_id.clone(),
                operation_id: op.id.clone(),
                detail,
            }
        })?;

        self.version += 1;
        transformed.version = self.version;
        self.history.push(transformed.clone());
        self.applied_ids.insert(key, self.version);
        self.track_pending(transformed.clone());

        log::debug!(
            "Room {}: applied {} from {} at version {}",
            self.room_id,
            transformed.id,
            transformed.client_id,
            self.version
        );

        Ok(ApplyResult {
            version: self.version,
            content: self.content.clone(),
            applied: transformed,
            duplicate: false,
        })
    }

    /// Splice an already-transformed operation into `content`.
    ///
    /// On failure the text is untouched.
    fn splice(&mut self, op: &mut Operation) -> Result<(), String> {
        match op.kind {
            OpKind::Insert => {
                let text = operation::insert_at(&self.content, op.position, &op.content)
                    .ok_or_else(|| {
                        format!(
                            "insert at {} past end of document ({} chars)",
                            op.position, self.content_chars
                        )
                    })?;
                self.content = text;
                self.content_chars += op.len();
            }
            OpKind::Delete => {
                let (rest, removed) =
                    operation::remove_range(&self.content, op.position, op.len()).ok_or_else(
                        || {
                            format!(
                                "delete {}..{} past end of document ({} chars)",
                                op.position,
                                op.end(),
                                self.content_chars
                            )
                        },
                    )?;
                if removed != op.content {
                    log::warn!(
                        "Room {}: delete {} expected {:?} but removed {:?}",
                        self.room_id,
                        op.id,
                        op.content,
                        removed
                    );
                    op.content = removed;
                }
                self.content = rest;
                self.content_chars -= op.len();
            }
        }
        Ok(())
    }

    fn duplicate_result(&self, version: u64) -> ApplyResult {
        let applied = self
            .history
            .get((version - self.base_version).saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_else(|| Operation::insert("", "", version, 0, ""));
        ApplyResult {
            version,
            content: self.content.clone(),
            applied,
            duplicate: true,
        }
    }

    fn track_pending(&mut self, op: Operation) {
        let queue = self.pending.entry(op.client_id.clone()).or_default();
        match queue.iter_mut().find(|p| p.id == op.id) {
            Some(existing) => *existing = op,
            None => queue.push(op),
        }
    }

    /// Re-apply an operation loaded from persistence, exactly as recorded.
    pub fn replay(&mut self, op: Operation) -> Result<(), OtError> {
        if op.version != self.version + 1 {
            return Err(ValidationError::new(
                "version",
                format!("replay of version {} onto version {}", op.version, self.version),
            )
            .into());
        }
        let mut op = op;
        self.splice(&mut op).map_err(|detail| OtError::TransformInvariant {
            room_id: self.room_id.clone(),
            operation_id: op.id.clone(),
            detail,
        })?;
        self.version = op.version;
        self.applied_ids
            .insert((op.client_id.clone(), op.id.clone()), op.version);
        self.history.push(op);
        Ok(())
    }

    /// Drop an operation from its client's pending queue. Absent ids are a no-op.
    pub fn acknowledge(&mut self, client_id: &str, operation_id: &str) -> bool {
        let Some(queue) = self.pending.get_mut(client_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|op| op.id != operation_id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.pending.remove(client_id);
        }
        removed
    }

    pub fn pending_for(&self, client_id: &str) -> &[Operation] {
        self.pending.get(client_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// History entries after `from_version`, excluding those from `requesting_client_id`.
    ///
    /// `None` when retained history does not reach back to `from_version`
    /// (see [`covers`](Self::covers)); the caller needs a full snapshot then.
    pub fn operations_since(
        &self,
        requesting_client_id: &str,
        from_version: u64,
    ) -> Option<Vec<Operation>> {
        if !self.covers(from_version) {
            return None;
        }
        let skip = (from_version - self.base_version) as usize;
        let ops = self.history[skip..]
            .iter()
            .filter(|op| op.client_id != requesting_client_id)
            .cloned()
            .collect();
        Some(ops)
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            client_count: self.pending.len(),
            total_pending: self.pending.values().map(Vec::len).sum(),
            max_queue_length: self.pending.values().map(Vec::len).max().unwrap_or(0),
        }
    }
}

/// Owns every room's document state.
pub struct OtEngine {
    documents: HashMap<String, DocumentState>,
    config: EngineConfig,
}

impl OtEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            documents: HashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Create a document with `seed` content at version 0.
    ///
    /// Refuses to overwrite an existing document.
    pub fn create_document_state(
        &mut self,
        room_id: &str,
        seed: &str,
    ) -> Result<&DocumentState, OtError> {
        if self.documents.contains_key(room_id) {
            return Err(OtError::DocumentExists(room_id.to_string()));
        }
        log::info!("Created document for room {room_id} ({} chars)", char_len(seed));
        Ok(self
            .documents
            .entry(room_id.to_string())
            .or_insert_with(|| DocumentState::new(room_id, seed)))
    }

    /// Install a document restored from a snapshot. Refuses to overwrite.
    pub fn restore_document_state(&mut self, state: DocumentState) -> Result<(), OtError> {
        let room_id = state.room_id().to_string();
        if self.documents.contains_key(&room_id) {
            return Err(OtError::DocumentExists(room_id));
        }
        log::info!("Restored document for room {room_id} at version {}", state.version());
        self.documents.insert(room_id, state);
        Ok(())
    }

    /// Get a document, creating an empty one if absent.
    pub fn get_document_state(&mut self, room_id: &str) -> &mut DocumentState {
        self.documents
            .entry(room_id.to_string())
            .or_insert_with(|| DocumentState::new(room_id, ""))
    }

    pub fn document(&self, room_id: &str) -> Option<&DocumentState> {
        self.documents.get(room_id)
    }

    pub fn has_document(&self, room_id: &str) -> bool {
        self.documents.contains_key(room_id)
    }

    /// Validate, transform and apply `op` to the room's document.
    pub fn apply_operation(&mut self, room_id: &str, op: Operation) -> Result<ApplyResult, OtError> {
        self.validate(&op)?;
        self.get_document_state(room_id).apply(op)
    }

    fn validate(&self, op: &Operation) -> Result<(), ValidationError> {
        if op.id.is_empty() {
            return Err(ValidationError::new("operation.id", "must not be empty"));
        }
        if op.client_id.is_empty() {
            return Err(ValidationError::new("clientId", "must not be empty"));
        }
        if op.content.is_empty() {
            return Err(ValidationError::new("operation.content", "must not be empty"));
        }
        let chars = char_len(&op.content);
        if chars > self.config.max_content_chars {
            return Err(ValidationError::new(
                "operation.content",
                format!("{chars} chars exceeds limit of {}", self.config.max_content_chars),
            ));
        }
        Ok(())
    }

    /// Remove an operation from a client's pending queue. Never an error.
    pub fn acknowledge_operation(&mut self, room_id: &str, client_id: &str, operation_id: &str) -> bool {
        self.documents
            .get_mut(room_id)
            .is_some_and(|doc| doc.acknowledge(client_id, operation_id))
    }

    pub fn get_snapshot(&mut self, room_id: &str) -> Snapshot {
        self.get_document_state(room_id).snapshot()
    }

    /// Operations after `from_version` not authored by `requesting_client_id`.
    ///
    /// `None` for an unknown room or a version outside retained history.
    pub fn get_operations_since(
        &self,
        room_id: &str,
        requesting_client_id: &str,
        from_version: u64,
    ) -> Option<Vec<Operation>> {
        self.documents
            .get(room_id)
            .and_then(|doc| doc.operations_since(requesting_client_id, from_version))
    }

    pub fn get_queue_stats(&self, room_id: &str) -> QueueStats {
        self.documents
            .get(room_id)
            .map(DocumentState::queue_stats)
            .unwrap_or_default()
    }

    /// Drop a room's document. Callers persist a snapshot first if they need one.
    pub fn cleanup_room(&mut self, room_id: &str) -> Option<DocumentState> {
        let removed = self.documents.remove(room_id);
        if removed.is_some() {
            log::info!("Cleaned up document for room {room_id}");
        }
        removed
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentState> {
        self.documents.values()
    }
}
