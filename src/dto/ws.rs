use serde::{Deserialize, Serialize};

use crate::{
    dto::room::{ConnectionInfo, Display, Timer},
    error::TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// Messages pushed by the room socket.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomServerMessage {
    /// Full state sync sent right after joining.
    RoomState {
        /// Timers in room order.
        #[serde(default)]
        timers: Vec<Timer>,
        /// Displays defined for the room.
        #[serde(default)]
        displays: Vec<Display>,
        /// Participants currently connected.
        #[serde(default)]
        connections: Vec<ConnectionInfo>,
    },
    /// A timer was created or changed.
    TimerUpdated {
        /// New state of the timer.
        timer: Timer,
    },
    /// A timer was removed from the room.
    TimerDeleted {
        /// Identifier of the removed timer.
        timer_id: String,
    },
    /// A display was created or changed.
    DisplayUpdated {
        /// New state of the display.
        display: Display,
    },
    /// The set of connected participants changed.
    Connections {
        /// Every participant currently connected.
        connections: Vec<ConnectionInfo>,
    },
    /// The server rejected a command or reported a room-level failure.
    Error {
        /// Human readable reason.
        message: String,
    },
    /// Reply to [`RoomClientMessage::Ping`].
    Pong,
    /// Any message type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl RoomServerMessage {
    /// Decode a text frame received from the socket.
    pub fn from_json_str(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|err| TransportError::Protocol(err.to_string()))
    }
}

/// Control applied to a timer by a controller or the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    /// Start counting down from the configured duration.
    Start,
    /// Freeze the countdown.
    Pause,
    /// Continue a paused countdown.
    Resume,
    /// Return to the configured duration without running.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// Messages sent to the room socket.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomClientMessage {
    /// Drive a timer.
    TimerCommand {
        /// Target timer.
        timer_id: String,
        /// What to do with it.
        action: TimerAction,
    },
    /// Liveness check answered with [`RoomServerMessage::Pong`].
    Ping,
    /// Graceful goodbye sent before the socket closes.
    Close,
}
