use indexmap::IndexMap;
use thiserror::Error;

use crate::dto::{
    room::{ConnectionInfo, Display, Timer},
    ws::RoomServerMessage,
};

/// Lifecycle of a room socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Idle,
    /// Opening the socket, initially or after the link dropped.
    Connecting,
    /// Link is up and frames are being applied.
    Connected,
    /// Gave up; only a new `connect` leaves this state.
    Error,
}

/// Events driving [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A caller asked to join a room.
    Connect,
    /// The transport handed back a live link.
    Opened,
    /// The live link dropped.
    LinkLost,
    /// Every allowed attempt failed.
    GaveUp,
    /// The caller left the room.
    Disconnect,
}

/// Error returned when an event does not apply to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from:?}")]
pub struct InvalidTransition {
    /// State the event was applied to.
    pub from: ConnectionState,
    /// Rejected event.
    pub event: ConnectionEvent,
}

impl ConnectionState {
    /// Compute the state reached by applying `event`, if the transition is valid.
    pub fn next(self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        let next = match (self, event) {
            (_, ConnectionEvent::Disconnect) => ConnectionState::Idle,
            (ConnectionState::Idle | ConnectionState::Error, ConnectionEvent::Connect) => {
                ConnectionState::Connecting
            }
            (ConnectionState::Connecting, ConnectionEvent::Opened) => ConnectionState::Connected,
            (ConnectionState::Connecting, ConnectionEvent::GaveUp) => ConnectionState::Error,
            (ConnectionState::Connected, ConnectionEvent::LinkLost) => ConnectionState::Connecting,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

/// Room state published to every observer of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomSnapshot {
    /// Room being joined or watched, `None` while idle.
    pub room_id: Option<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Timers keyed by id, in the order the room first reported them.
    pub timers: IndexMap<String, Timer>,
    /// Displays keyed by id.
    pub displays: IndexMap<String, Display>,
    /// Participants currently in the room.
    pub connections: Vec<ConnectionInfo>,
    /// Last error reported by the room or the transport.
    pub last_error: Option<String>,
    /// Increments on every published change.
    pub version: usize,
}

impl RoomSnapshot {
    /// True while the link is up.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Number of participants in the room.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Apply a lifecycle event, keeping the snapshot untouched when it is invalid.
    pub fn transition(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, InvalidTransition> {
        self.state = self.state.next(event)?;
        self.version += 1;
        Ok(self.state)
    }

    /// Fold a server message into the room state. Returns whether anything changed.
    pub fn apply(&mut self, message: RoomServerMessage) -> bool {
        match message {
            RoomServerMessage::RoomState {
                timers,
                displays,
                connections,
            } => {
                self.timers = timers
                    .into_iter()
                    .map(|timer| (timer.id.clone(), timer))
                    .collect();
                self.displays = displays
                    .into_iter()
                    .map(|display| (display.id.clone(), display))
                    .collect();
                self.connections = connections;
                self.last_error = None;
            }
            RoomServerMessage::TimerUpdated { timer } => {
                self.timers.insert(timer.id.clone(), timer);
            }
            RoomServerMessage::TimerDeleted { timer_id } => {
                self.timers.shift_remove(&timer_id);
            }
            RoomServerMessage::DisplayUpdated { display } => {
                self.displays.insert(display.id.clone(), display);
            }
            RoomServerMessage::Connections { connections } => {
                self.connections = connections;
            }
            RoomServerMessage::Error { message } => {
                self.last_error = Some(message);
            }
            RoomServerMessage::Pong | RoomServerMessage::Unknown => return false,
        }
        self.version += 1;
        true
    }

    /// Forget everything learned about the room.
    pub fn clear(&mut self) {
        self.room_id = None;
        self.timers.clear();
        self.displays.clear();
        self.connections.clear();
        self.last_error = None;
        self.version += 1;
    }
}
