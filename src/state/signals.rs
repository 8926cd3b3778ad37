use tokio::sync::broadcast;

/// In-process signals decoupling the outbound request layer from the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The request layer exhausted its unauthorized retries; the session must end.
    AuthRequired,
    /// A proactive refresh installed a new token.
    TokenRefreshed,
}

/// User-visible notification (the CLI logs them, a UI would toast them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// An operation completed.
    Success(String),
    /// Neutral status information.
    Info(String),
    /// An operation failed.
    Error(String),
}

/// Simple broadcast hub wrapper; delivery errors (no subscribers) are ignored.
#[derive(Clone)]
pub struct Hub<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Hub<T> {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent values.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Send a value to all current subscribers.
    pub fn broadcast(&self, value: T) {
        let _ = self.sender.send(value);
    }
}

/// Hub carrying [`SessionSignal`]s.
pub type SignalHub = Hub<SessionSignal>;
/// Hub carrying [`Notice`]s.
pub type NoticeHub = Hub<Notice>;
