//! Lifecycle of the single socket connecting the client to a room.
//!
//! A background driver task owns the transport link: it folds inbound messages into the
//! published [`RoomSnapshot`] and reopens the link when it drops. Callers observe the room
//! through a `watch` channel and push timer commands with [`RoomConnection::send`].

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    config::RoomSettings,
    dto::ws::{RoomClientMessage, RoomServerMessage},
    error::{ConnectionError, TransportError},
    state::connection::{ConnectionEvent, ConnectionState, RoomSnapshot},
};

/// Frames delivered by an open link; the channel closing means the peer went away.
pub type InboundFrames = mpsc::UnboundedReceiver<Result<RoomServerMessage, TransportError>>;

/// An open, bidirectional link to a room.
pub struct RoomLink {
    /// Commands to send; closing it ends the link.
    pub outbound: mpsc::UnboundedSender<RoomClientMessage>,
    /// Decoded frames from the room.
    pub inbound: InboundFrames,
}

/// Credentials presented when joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAccess {
    /// Account session token of the room owner.
    Session(String),
    /// Room-scoped token granting timer control.
    Controller(String),
    /// Room-scoped read-only token.
    Viewer(String),
}

impl RoomAccess {
    /// Query parameter carrying the credential on the socket URL.
    pub fn query_pair(&self) -> (&'static str, &str) {
        match self {
            RoomAccess::Session(token) => ("token", token),
            RoomAccess::Controller(token) => ("controller_token", token),
            RoomAccess::Viewer(token) => ("viewer_token", token),
        }
    }
}

/// Opens links to rooms. Implemented over WebSocket in production and faked in tests.
pub trait RoomTransport: Send + Sync {
    /// Open a link to `room_id` authenticated with `access`.
    fn open(
        &self,
        room_id: &str,
        access: &RoomAccess,
    ) -> BoxFuture<'static, Result<RoomLink, TransportError>>;
}

/// Reconnection policy of a single `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Reopen the link when it fails or drops.
    pub auto_reconnect: bool,
    /// Pause before each reopen attempt.
    pub reconnect_interval: Duration,
    /// Reopen attempts allowed after a failure, on top of the initial one.
    pub max_reconnect_attempts: u32,
}

impl From<&RoomSettings> for ConnectOptions {
    fn from(settings: &RoomSettings) -> Self {
        Self {
            auto_reconnect: settings.auto_reconnect,
            reconnect_interval: settings.reconnect_interval,
            max_reconnect_attempts: settings.max_reconnect_attempts,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&RoomSettings::default())
    }
}

struct Shared {
    snapshot: watch::Sender<RoomSnapshot>,
    outbound: Mutex<Option<mpsc::UnboundedSender<RoomClientMessage>>>,
    /// Bumped by every disconnect; drivers of an older epoch stop publishing.
    epoch: AtomicU64,
}

impl Shared {
    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<RoomClientMessage>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owner of one room connection at a time.
pub struct RoomConnection {
    transport: Arc<dyn RoomTransport>,
    access: RoomAccess,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RoomConnection {
    /// Idle connection that will join rooms through `transport` with `access`.
    pub fn new(transport: Arc<dyn RoomTransport>, access: RoomAccess) -> Self {
        let (snapshot, _rx) = watch::channel(RoomSnapshot::default());
        Self {
            transport,
            access,
            shared: Arc::new(Shared {
                snapshot,
                outbound: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Current room state and connection status.
    pub fn snapshot(&self) -> RoomSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Watch every change of the room snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Join `room_id`, resolving once the link is up.
    ///
    /// Any previous connection is closed first. With `auto_reconnect` a failed initial open is
    /// retried up to `max_reconnect_attempts` times before giving up.
    pub async fn connect(
        &self,
        room_id: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<(), ConnectionError> {
        let room_id = room_id.into();
        self.disconnect();

        let mut epoch = 0;
        self.shared.snapshot.send_modify(|snapshot| {
            epoch = self.shared.epoch.load(Ordering::Acquire);
            snapshot.room_id = Some(room_id.clone());
            advance(snapshot, ConnectionEvent::Connect);
        });
        info!(%room_id, ?options, "connecting to room");

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            shared: self.shared.clone(),
            epoch,
            transport: self.transport.clone(),
            access: self.access.clone(),
            room_id: room_id.clone(),
            options,
        };
        let handle = tokio::spawn(driver.run(ready_tx));
        if let Some(previous) = self.lock_driver().replace(handle) {
            previous.abort();
        }

        ready_rx
            .await
            .unwrap_or(Err(ConnectionError::Cancelled { room_id }))
    }

    /// Leave the room. Safe to call in any state and more than once.
    pub fn disconnect(&self) {
        if let Some(driver) = self.lock_driver().take() {
            driver.abort();
        }

        let mut outbound = None;
        self.shared.snapshot.send_if_modified(|snapshot| {
            self.shared.epoch.fetch_add(1, Ordering::AcqRel);
            outbound = self.shared.lock_outbound().take();
            if snapshot.room_id.is_none() && snapshot.state == ConnectionState::Idle {
                return false;
            }
            advance(snapshot, ConnectionEvent::Disconnect);
            snapshot.clear();
            true
        });

        if let Some(outbound) = outbound {
            let _ = outbound.send(RoomClientMessage::Close);
            info!("left room");
        }
    }

    /// Forward a message to the room; fails unless a link is up.
    pub fn send(&self, message: RoomClientMessage) -> Result<(), ConnectionError> {
        let outbound = self.shared.lock_outbound();
        let outbound = outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(message)
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn advance(snapshot: &mut RoomSnapshot, event: ConnectionEvent) {
    if let Err(err) = snapshot.transition(event) {
        warn!(error = %err, "ignoring room connection event");
    }
}

struct Driver {
    shared: Arc<Shared>,
    epoch: u64,
    transport: Arc<dyn RoomTransport>,
    access: RoomAccess,
    room_id: String,
    options: ConnectOptions,
}

impl Driver {
    async fn run(self, ready: oneshot::Sender<Result<(), ConnectionError>>) {
        let link = match self.open_link(true).await {
            Ok(link) => link,
            Err(err) => {
                self.give_up(&err);
                let _ = ready.send(Err(err));
                return;
            }
        };
        let Some(mut inbound) = self.attach(link) else {
            return;
        };
        info!(room_id = %self.room_id, "connected to room");
        let _ = ready.send(Ok(()));

        loop {
            let reason = self.pump(&mut inbound).await;
            warn!(room_id = %self.room_id, error = %reason, "room link lost");
            if !self.update(|snapshot| {
                self.shared.lock_outbound().take();
                snapshot.last_error = Some(reason.to_string());
                advance(snapshot, ConnectionEvent::LinkLost);
                true
            }) {
                return;
            }

            if !self.options.auto_reconnect {
                self.give_up(&ConnectionError::Failed {
                    room_id: self.room_id.clone(),
                    source: reason,
                });
                return;
            }

            match self.open_link(false).await {
                Ok(link) => match self.attach(link) {
                    Some(next) => {
                        info!(room_id = %self.room_id, "reconnected to room");
                        inbound = next;
                    }
                    None => return,
                },
                Err(err) => {
                    self.give_up(&err);
                    return;
                }
            }
        }
    }

    /// Open a link, retrying per the options. The reconnect budget starts fresh on every call.
    async fn open_link(&self, initial: bool) -> Result<RoomLink, ConnectionError> {
        if initial {
            match self.open().await {
                Ok(link) => return Ok(link),
                Err(source) if !self.options.auto_reconnect => {
                    return Err(ConnectionError::Failed {
                        room_id: self.room_id.clone(),
                        source,
                    });
                }
                Err(_) => {}
            }
        }

        let max = self.options.max_reconnect_attempts;
        for attempt in 1..=max {
            sleep(self.options.reconnect_interval).await;
            info!(room_id = %self.room_id, attempt, max, "reconnecting to room");
            if let Ok(link) = self.open().await {
                return Ok(link);
            }
        }
        Err(ConnectionError::ReconnectExhausted {
            room_id: self.room_id.clone(),
            attempts: max,
        })
    }

    async fn open(&self) -> Result<RoomLink, TransportError> {
        let result = self.transport.open(&self.room_id, &self.access).await;
        if let Err(err) = &result {
            warn!(room_id = %self.room_id, error = %err, "failed to open room link");
            self.update(|snapshot| {
                snapshot.last_error = Some(err.to_string());
                true
            });
        }
        result
    }

    fn attach(&self, link: RoomLink) -> Option<InboundFrames> {
        let RoomLink { outbound, inbound } = link;
        self.update(|snapshot| {
            *self.shared.lock_outbound() = Some(outbound);
            snapshot.last_error = None;
            advance(snapshot, ConnectionEvent::Opened);
            true
        })
        .then_some(inbound)
    }

    /// Apply inbound frames until the link ends, returning why it ended.
    async fn pump(&self, inbound: &mut InboundFrames) -> TransportError {
        while let Some(frame) = inbound.recv().await {
            match frame {
                Ok(message) => {
                    debug!(room_id = %self.room_id, ?message, "room message");
                    self.update(|snapshot| snapshot.apply(message));
                }
                Err(TransportError::Protocol(reason)) => {
                    warn!(room_id = %self.room_id, %reason, "ignoring malformed room frame");
                }
                Err(err) => return err,
            }
        }
        TransportError::Closed
    }

    fn give_up(&self, err: &ConnectionError) {
        warn!(room_id = %self.room_id, error = %err, "giving up on room");
        self.update(|snapshot| {
            self.shared.lock_outbound().take();
            snapshot.last_error = Some(err.to_string());
            advance(snapshot, ConnectionEvent::GaveUp);
            true
        });
    }

    /// Publish a change unless a disconnect superseded this driver. Returns whether it is current.
    fn update(&self, modify: impl FnOnce(&mut RoomSnapshot) -> bool) -> bool {
        let mut current = true;
        self.shared.snapshot.send_if_modified(|snapshot| {
            if self.shared.epoch.load(Ordering::Acquire) != self.epoch {
                current = false;
                return false;
            }
            modify(snapshot)
        });
        current
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::AtomicU32,
    };

    use tokio::time::Instant;

    use super::*;
    use crate::dto::{
        room::{Timer, TimerStatus},
        ws::TimerAction,
    };

    /// Server side of a link handed out by [`FakeTransport`].
    struct Peer {
        outbound: mpsc::UnboundedReceiver<RoomClientMessage>,
        inbound: mpsc::UnboundedSender<Result<RoomServerMessage, TransportError>>,
    }

    #[derive(Default)]
    struct FakeTransport {
        opens: AtomicU32,
        /// `true` accepts the next open; an empty script refuses everything.
        script: Mutex<VecDeque<bool>>,
        peers: Mutex<VecDeque<Peer>>,
    }

    impl FakeTransport {
        fn scripted(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
            let transport = Self::default();
            transport.script.lock().unwrap().extend(script);
            Arc::new(transport)
        }

        fn push(&self, script: impl IntoIterator<Item = bool>) {
            self.script.lock().unwrap().extend(script);
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }

        fn next_peer(&self) -> Peer {
            self.peers.lock().unwrap().pop_front().unwrap()
        }
    }

    impl RoomTransport for FakeTransport {
        fn open(
            &self,
            _room_id: &str,
            _access: &RoomAccess,
        ) -> BoxFuture<'static, Result<RoomLink, TransportError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let accept = self.script.lock().unwrap().pop_front().unwrap_or(false);
            let result = if accept {
                let (outbound, peer_outbound) = mpsc::unbounded_channel();
                let (peer_inbound, inbound) = mpsc::unbounded_channel();
                self.peers.lock().unwrap().push_back(Peer {
                    outbound: peer_outbound,
                    inbound: peer_inbound,
                });
                Ok(RoomLink { outbound, inbound })
            } else {
                Err(TransportError::Open("connection refused".into()))
            };
            Box::pin(async move { result })
        }
    }

    fn connection(transport: Arc<FakeTransport>) -> RoomConnection {
        RoomConnection::new(transport, RoomAccess::Viewer("viewer-token".into()))
    }

    fn options(auto_reconnect: bool, max_reconnect_attempts: u32) -> ConnectOptions {
        ConnectOptions {
            auto_reconnect,
            reconnect_interval: Duration::from_millis(3_000),
            max_reconnect_attempts,
        }
    }

    fn timer(id: &str) -> Timer {
        Timer {
            id: id.into(),
            name: "Keynote".into(),
            duration_ms: 600_000,
            remaining_ms: 600_000,
            status: TimerStatus::Idle,
            display_id: None,
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<RoomSnapshot>, state: ConnectionState) {
        rx.wait_for(|snapshot| snapshot.state == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_room_is_opened_at_most_six_times() {
        let transport = FakeTransport::scripted([]);
        let room = connection(transport.clone());

        let started = Instant::now();
        let err = room.connect("42", options(true, 5)).await.unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::ReconnectExhausted { ref room_id, attempts: 5 } if room_id == "42"
        ));
        assert_eq!(transport.opens(), 6);
        assert_eq!(started.elapsed(), Duration::from_millis(15_000));
        let snapshot = room.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn without_auto_reconnect_the_first_failure_rejects() {
        let transport = FakeTransport::scripted([]);
        let room = connection(transport.clone());

        let err = room.connect("42", options(false, 5)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Failed { .. }));
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_after_retries_and_applies_messages() {
        let transport = FakeTransport::scripted([false, false, true]);
        let room = connection(transport.clone());

        room.connect("42", options(true, 5)).await.unwrap();
        assert_eq!(transport.opens(), 3);
        assert!(room.snapshot().is_connected());

        let peer = transport.next_peer();
        peer.inbound
            .send(Ok(RoomServerMessage::RoomState {
                timers: vec![timer("t1"), timer("t2")],
                displays: vec![],
                connections: vec![],
            }))
            .unwrap();

        let mut rx = room.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.timers.len() == 2)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.room_id.as_deref(), Some("42"));
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_reconnects_with_a_fresh_budget() {
        let transport = FakeTransport::scripted([true]);
        let room = connection(transport.clone());
        let mut rx = room.subscribe();

        room.connect("42", options(true, 2)).await.unwrap();
        drop(transport.next_peer());

        // Link lost: one refusal, then accepted within the budget of two.
        transport.push([false, true]);
        wait_for_state(&mut rx, ConnectionState::Connecting).await;
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 3);

        // Lost again: the budget starts over and both reconnects are spent before giving up.
        drop(transport.next_peer());
        wait_for_state(&mut rx, ConnectionState::Error).await;
        assert_eq!(transport.opens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_link_and_is_idempotent() {
        let transport = FakeTransport::scripted([true]);
        let room = connection(transport.clone());
        room.connect("42", options(true, 5)).await.unwrap();
        let mut peer = transport.next_peer();

        room.send(RoomClientMessage::TimerCommand {
            timer_id: "t1".into(),
            action: TimerAction::Start,
        })
        .unwrap();
        assert_eq!(
            peer.outbound.recv().await,
            Some(RoomClientMessage::TimerCommand {
                timer_id: "t1".into(),
                action: TimerAction::Start,
            })
        );

        room.disconnect();
        assert_eq!(peer.outbound.recv().await, Some(RoomClientMessage::Close));
        let snapshot = room.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Idle);
        assert_eq!(snapshot.room_id, None);
        assert!(snapshot.timers.is_empty());

        let version = snapshot.version;
        room.disconnect();
        assert_eq!(room.snapshot().version, version);
        assert!(matches!(
            room.send(RoomClientMessage::Ping),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_cancels() {
        let transport = FakeTransport::scripted([]);
        let room = Arc::new(connection(transport.clone()));

        let pending = tokio::spawn({
            let room = room.clone();
            async move { room.connect("42", options(true, 5)).await }
        });
        sleep(Duration::from_millis(4_000)).await;
        room.disconnect();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ConnectionError::Cancelled { .. })
        ));
        assert_eq!(transport.opens(), 2);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(room.snapshot().state, ConnectionState::Idle);
    }
}
