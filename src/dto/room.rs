use serde::{Deserialize, Serialize};

/// Run state of a timer as reported by the room socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// Not started yet.
    #[default]
    Idle,
    /// Counting down.
    Running,
    /// Stopped with time remaining.
    Paused,
    /// Reached zero.
    Finished,
}

/// A timer inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// Timer identifier, unique within the room.
    pub id: String,
    /// Label shown above the countdown.
    pub name: String,
    /// Configured length.
    pub duration_ms: u64,
    /// Time left when the update was emitted.
    pub remaining_ms: u64,
    /// Current run state.
    #[serde(default)]
    pub status: TimerStatus,
    /// Display configuration applied to this timer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

/// Named visual configuration applied to a timer's presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Display {
    /// Display identifier.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Opaque presentation settings owned by the web client.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Role a participant joined the room with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// Account that owns the room.
    Owner,
    /// Holder of a controller link.
    Controller,
    /// Holder of a viewer link.
    Viewer,
}

/// Per-connection metadata published by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: String,
    /// Role granted by the credential used to join.
    pub role: ConnectionRole,
    /// Participant name, if the client sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// RFC 3339 timestamp of when the participant joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}
