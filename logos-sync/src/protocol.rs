//! JSON wire protocol between editors and the sync server.
//!
//! Every frame is a JSON object tagged on `"type"`:
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! JOIN_ROOM        {roomId,userId,     ROOM_JOINED     {roomId,clientId,version,
//!                   clientId}                           content,participants}
//! LEAVE_ROOM       {roomId,clientId}   USER_JOINED / USER_LEFT
//! OT_OP            {roomId,clientId,   OT_OP           {roomId,clientId,
//!                   operation}                          operation,version}
//! CURSOR_UPDATE    {roomId,clientId,   ACK             {roomId,clientId,
//!                   cursor}                             operationId,version}
//! SYNC_STATE       {roomId,clientId,   CURSOR_UPDATE / PRESENCE_UPDATE
//!                   fromVersion?}      SYNC_STATE      {roomId,version,content?,
//! ACK              {roomId,clientId,                    operations}
//!                   operationId}       ERROR           {code,message,roomId?,
//! PRESENCE_UPDATE  {roomId,clientId}                    clientId?,timestamp}
//! ```
//!
//! Inbound frames only reach the hub through [`MessageValidator::validate`].

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::{ValidationError, WireError};
use crate::operation::{char_len, OpKind, Operation};
use crate::presence::{Cursor, Participant};

/// Type tags a client may send.
pub const CLIENT_MESSAGE_TYPES: [&str; 7] = [
    "JOIN_ROOM",
    "LEAVE_ROOM",
    "OT_OP",
    "CURSOR_UPDATE",
    "SYNC_STATE",
    "ACK",
    "PRESENCE_UPDATE",
];

/// Operation payload of an `OT_OP` frame.
///
/// The owning client id comes from the enclosing frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    pub id: String,
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: usize,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl WireOperation {
    /// Attach the submitting client and user.
    pub fn into_operation(self, client_id: &str, user_id: &str) -> Operation {
        let op = match self.kind {
            OpKind::Insert => {
                Operation::insert(self.id, client_id, self.version, self.position, self.content)
            }
            OpKind::Delete => {
                Operation::delete(self.id, client_id, self.version, self.position, self.content)
            }
        };
        let mut op = op.with_user(user_id);
        if let Some(ts) = self.timestamp {
            op.timestamp = ts;
        }
        op
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        user_id: String,
        client_id: String,
    },
    LeaveRoom {
        room_id: String,
        client_id: String,
    },
    OtOp {
        room_id: String,
        client_id: String,
        operation: WireOperation,
    },
    CursorUpdate {
        room_id: String,
        client_id: String,
        cursor: Cursor,
    },
    SyncState {
        room_id: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_version: Option<u64>,
    },
    Ack {
        room_id: String,
        client_id: String,
        operation_id: String,
    },
    PresenceUpdate {
        room_id: String,
        client_id: String,
    },
}

impl ClientMessage {
    pub fn room_id(&self) -> &str {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::LeaveRoom { room_id, .. }
            | ClientMessage::OtOp { room_id, .. }
            | ClientMessage::CursorUpdate { room_id, .. }
            | ClientMessage::SyncState { room_id, .. }
            | ClientMessage::Ack { room_id, .. }
            | ClientMessage::PresenceUpdate { room_id, .. } => room_id,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            ClientMessage::JoinRoom { client_id, .. }
            | ClientMessage::LeaveRoom { client_id, .. }
            | ClientMessage::OtOp { client_id, .. }
            | ClientMessage::CursorUpdate { client_id, .. }
            | ClientMessage::SyncState { client_id, .. }
            | ClientMessage::Ack { client_id, .. }
            | ClientMessage::PresenceUpdate { client_id, .. } => client_id,
        }
    }

    /// Wire type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "JOIN_ROOM",
            ClientMessage::LeaveRoom { .. } => "LEAVE_ROOM",
            ClientMessage::OtOp { .. } => "OT_OP",
            ClientMessage::CursorUpdate { .. } => "CURSOR_UPDATE",
            ClientMessage::SyncState { .. } => "SYNC_STATE",
            ClientMessage::Ack { .. } => "ACK",
            ClientMessage::PresenceUpdate { .. } => "PRESENCE_UPDATE",
        }
    }

    /// Identifier fields with their wire names, for length checks.
    fn identifiers(&self) -> Vec<(&'static str, &str)> {
        let mut ids = vec![("roomId", self.room_id()), ("clientId", self.client_id())];
        match self {
            ClientMessage::JoinRoom { user_id, .. } => ids.push(("userId", user_id.as_str())),
            ClientMessage::OtOp { operation, .. } => ids.push(("operation.id", operation.id.as_str())),
            ClientMessage::Ack { operation_id, .. } => ids.push(("operationId", operation_id.as_str())),
            ClientMessage::LeaveRoom { .. }
            | ClientMessage::CursorUpdate { .. }
            | ClientMessage::SyncState { .. }
            | ClientMessage::PresenceUpdate { .. } => {}
        }
        ids
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Sent to the joining client only
    RoomJoined {
        room_id: String,
        client_id: String,
        version: u64,
        content: String,
        participants: Vec<Participant>,
    },
    UserJoined {
        room_id: String,
        participant: Participant,
        participant_count: usize,
    },
    UserLeft {
        room_id: String,
        user_id: String,
        client_id: String,
        participant_count: usize,
    },
    /// An applied operation; `operation.version` is the version it produced
    OtOp {
        room_id: String,
        client_id: String,
        operation: Operation,
        version: u64,
    },
    Ack {
        room_id: String,
        client_id: String,
        operation_id: String,
        version: u64,
        timestamp: u64,
    },
    CursorUpdate {
        room_id: String,
        client_id: String,
        user_id: String,
        cursor: Cursor,
    },
    PresenceUpdate {
        room_id: String,
        participants: Vec<Participant>,
    },
    /// `content` is present when the requested range could not be served
    /// from history; `operations` is then empty
    SyncState {
        room_id: String,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        operations: Vec<Operation>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        timestamp: u64,
    },
}

impl ServerMessage {
    /// `ERROR` frame from a raw code and message.
    pub fn error(
        code: &str,
        message: impl Into<String>,
        room_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            room_id: room_id.map(str::to_string),
            client_id: client_id.map(str::to_string),
            timestamp: crate::now_millis(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a server frame (client side and tests).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "ROOM_JOINED",
            ServerMessage::UserJoined { .. } => "USER_JOINED",
            ServerMessage::UserLeft { .. } => "USER_LEFT",
            ServerMessage::OtOp { .. } => "OT_OP",
            ServerMessage::Ack { .. } => "ACK",
            ServerMessage::CursorUpdate { .. } => "CURSOR_UPDATE",
            ServerMessage::PresenceUpdate { .. } => "PRESENCE_UPDATE",
            ServerMessage::SyncState { .. } => "SYNC_STATE",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

/// Protocol encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parses and checks inbound frames.
#[derive(Debug, Clone)]
pub struct MessageValidator {
    /// Maximum chars in roomId/userId/clientId/operation ids
    pub max_identifier_len: usize,
    /// Maximum chars in an operation's content
    pub max_content_chars: usize,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self {
            max_identifier_len: 100,
            max_content_chars: 10_000,
        }
    }
}

impl MessageValidator {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_identifier_len: config.max_identifier_len,
            max_content_chars: config.engine.max_content_chars,
        }
    }

    /// Parse a raw text frame into a typed message.
    pub fn validate(&self, raw: &str) -> Result<ClientMessage, ValidationError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ValidationError::malformed(format!("not valid JSON: {e}")))?;

        let Some(object) = value.as_object() else {
            return Err(ValidationError::malformed("expected a JSON object"));
        };
        let raw_type = match object.get("type") {
            Some(serde_json::Value::String(t)) => t.as_str(),
            Some(_) => return Err(ValidationError::new("type", "must be a string")),
            None => return Err(ValidationError::new("type", "missing")),
        };
        let Some(msg_type) = CLIENT_MESSAGE_TYPES.iter().copied().find(|t| *t == raw_type) else {
            return Err(ValidationError::new(
                "type",
                format!("unknown message type {raw_type}"),
            ));
        };
        check_counts(object, &["fromVersion"])?;
        if let Some(serde_json::Value::Object(op)) = object.get("operation") {
            check_counts(op, &["version", "position"])?;
        }
        if let Some(serde_json::Value::Object(cursor)) = object.get("cursor") {
            check_counts(cursor, &["line", "column"])?;
        }

        let message: ClientMessage = serde_json::from_value(value)
            .map_err(|e| ValidationError::malformed(format!("{msg_type}: {e}")))?;

        for (field, id) in message.identifiers() {
            if id.is_empty() {
                return Err(ValidationError::new(field, "must not be empty"));
            }
            let len = char_len(id);
            if len > self.max_identifier_len {
                return Err(ValidationError::new(
                    field,
                    format!("{len} chars exceeds limit of {}", self.max_identifier_len),
                ));
            }
        }
        if let ClientMessage::OtOp { operation, .. } = &message {
            let len = char_len(&operation.content);
            if len > self.max_content_chars {
                return Err(ValidationError::new(
                    "operation.content",
                    format!("{len} chars exceeds limit of {}", self.max_content_chars),
                ));
            }
        }
        Ok(message)
    }

    pub fn build_ack_message(
        &self,
        room_id: &str,
        client_id: &str,
        operation_id: &str,
        version: u64,
    ) -> ServerMessage {
        ServerMessage::Ack {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            operation_id: operation_id.to_string(),
            version,
            timestamp: crate::now_millis(),
        }
    }

    pub fn build_error_message(
        &self,
        error: &dyn WireError,
        room_id: Option<&str>,
        client_id: Option<&str>,
    ) -> ServerMessage {
        ServerMessage::error(error.code(), error.to_string(), room_id, client_id)
    }
}

/// Integer fields must lie in `0..=i64::MAX`, so later position arithmetic
/// cannot overflow.
fn check_counts(
    object: &serde_json::Map<String, serde_json::Value>,
    fields: &[&str],
) -> Result<(), ValidationError> {
    for field in fields {
        let Some(serde_json::Value::Number(n)) = object.get(*field) else {
            continue;
        };
        match n.as_i64() {
            Some(v) if v < 0 => {
                return Err(ValidationError::new(*field, format!("must be >= 0, got {v}")));
            }
            Some(_) => {}
            None if n.is_u64() => {
                return Err(ValidationError::new(*field, format!("{n} is out of range")));
            }
            None => {}
        }
    }
    Ok(())
}
