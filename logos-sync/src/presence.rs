//! Per-client presence: cursor position and activity timestamps.

use serde::{Deserialize, Serialize};

/// Caret position in line/column coordinates (both zero-based).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

impl Cursor {
    pub const ORIGIN: Cursor = Cursor { line: 0, column: 0 };

    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Live presence state of one connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub client_id: String,
    pub cursor: Cursor,
    /// Milliseconds since the Unix epoch
    pub joined_at: u64,
    /// Milliseconds since the Unix epoch
    pub last_activity: u64,
}

impl UserPresence {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        let now = crate::now_millis();
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            cursor: Cursor::ORIGIN,
            joined_at: now,
            last_activity: now,
        }
    }

    /// Move the cursor; counts as activity.
    pub fn move_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = crate::now_millis();
    }

    /// Milliseconds since the last activity, relative to `now_ms`.
    pub fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity)
    }

    pub fn participant(&self) -> Participant {
        Participant {
            user_id: self.user_id.clone(),
            client_id: self.client_id.clone(),
            cursor: self.cursor,
            joined_at: self.joined_at,
        }
    }
}

/// Public view of a participant, as listed to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub client_id: String,
    pub cursor: Cursor,
    pub joined_at: u64,
}
