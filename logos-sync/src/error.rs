//! Error taxonomy for the collaboration core.
//!
//! Rate limiting and backpressure are not errors: they come back as
//! [`RateDecision`](crate::limiter::RateDecision) values.

/// Stable error codes carried by `ERROR` wire frames.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const ROOM_FULL: &str = "ROOM_FULL";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const BACKPRESSURE: &str = "BACKPRESSURE";
    pub const NOT_IN_ROOM: &str = "NOT_IN_ROOM";
    pub const DOCUMENT_EXISTS: &str = "DOCUMENT_EXISTS";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// An error that can be reported to a client in an `ERROR` frame.
pub trait WireError: std::fmt::Display {
    fn code(&self) -> &'static str;
}

/// Malformed wire message or operation. Reported to the sender only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Offending field (wire name), empty when the whole frame is bad
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Error for a frame that could not be parsed at all.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.field.is_empty() {
            write!(f, "Invalid message: {}", self.message)
        } else {
            write!(f, "Invalid {}: {}", self.field, self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl WireError for ValidationError {
    fn code(&self) -> &'static str {
        codes::VALIDATION_ERROR
    }
}

/// Room admission errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Room already holds `max_participants` connections
    Capacity { room_id: String, max_participants: usize },
    /// Client is not connected to the room
    NotInRoom { room_id: String, client_id: String },
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::Capacity { .. } => codes::ROOM_FULL,
            RoomError::NotInRoom { .. } => codes::NOT_IN_ROOM,
        }
    }
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Capacity { room_id, max_participants } => {
                write!(f, "Room {room_id} is full ({max_participants} participants)")
            }
            RoomError::NotInRoom { room_id, client_id } => {
                write!(f, "Client {client_id} is not in room {room_id}")
            }
        }
    }
}

impl std::error::Error for RoomError {}

impl WireError for RoomError {
    fn code(&self) -> &'static str {
        RoomError::code(self)
    }
}

/// OT engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// Structurally invalid operation, rejected before any transform
    Validation(ValidationError),
    /// `create_document_state` called for a room that already has one
    DocumentExists(String),
    /// Transform/apply produced an impossible edit; the operation was dropped
    TransformInvariant { room_id: String, operation_id: String, detail: String },
}

impl OtError {
    pub fn code(&self) -> &'static str {
        match self {
            OtError::Validation(_) => codes::VALIDATION_ERROR,
            OtError::DocumentExists(_) => codes::DOCUMENT_EXISTS,
            OtError::TransformInvariant { .. } => codes::INTERNAL_ERROR,
        }
    }
}

impl From<ValidationError> for OtError {
    fn from(e: ValidationError) -> Self {
        OtError::Validation(e)
    }
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::Validation(e) => write!(f, "{e}"),
            OtError::DocumentExists(room_id) => {
                write!(f, "Document state for room {room_id} already exists")
            }
            OtError::TransformInvariant { room_id, operation_id, detail } => write!(
                f,
                "Transform invariant violated in room {room_id} by operation {operation_id}: {detail}"
            ),
        }
    }
}

impl std::error::Error for OtError {}

impl WireError for OtError {
    fn code(&self) -> &'static str {
        OtError::code(self)
    }
}

/// Persistence errors. Logged and swallowed on the live path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    SerializationError(String),
    DeserializationError(String),
    DecompressionFailed(String),
    LockPoisoned,
    /// Background writer has shut down
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::SerializationError(e) => write!(f, "Store serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Store deserialization error: {e}"),
            StoreError::DecompressionFailed(e) => write!(f, "Snapshot decompression failed: {e}"),
            StoreError::LockPoisoned => write!(f, "Store lock poisoned"),
            StoreError::Closed => write!(f, "Persistence writer is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let e = ValidationError::new("position", "must be >= 0");
        assert_eq!(e.to_string(), "Invalid position: must be >= 0");
        assert_eq!(
            ValidationError::malformed("not json").to_string(),
            "Invalid message: not json"
        );
    }

    #[test]
    fn test_error_codes() {
        let full = RoomError::Capacity { room_id: "r".into(), max_participants: 2 };
        assert_eq!(full.code(), codes::ROOM_FULL);

        let ot: OtError = ValidationError::new("content", "too long").into();
        assert_eq!(ot.code(), codes::VALIDATION_ERROR);
        assert_eq!(OtError::DocumentExists("r".into()).code(), codes::DOCUMENT_EXISTS);
    }
}
