/// Room connection lifecycle state and the room snapshot reducer.
pub mod connection;
/// Session signals and user-facing notices.
pub mod signals;
/// Access token decoding and refresh scheduling.
pub mod token;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dao::{
    storage::StorageError,
    token_store::{StorageEvent, TokenStore},
};

pub use self::signals::{Notice, NoticeHub, SessionSignal, SignalHub};
pub use self::token::{RefreshSchedule, SessionToken, TokenError};

/// Shared handle to a [`SessionManager`].
pub type SharedSession = Arc<SessionManager>;

const SIGNAL_CAPACITY: usize = 16;
const NOTICE_CAPACITY: usize = 32;

/// Failures while installing a token into the session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The token could not be decoded.
    #[error("invalid session token")]
    Token(#[from] TokenError),
    /// The token could not be persisted.
    #[error("failed to persist session token")]
    Storage(#[from] StorageError),
}

/// Tri-state authentication flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No auth event has been resolved yet.
    Uninitialized,
    /// The backend confirmed the current user.
    Authenticated,
    /// No user is signed in.
    Unauthenticated,
}

/// Identity of the last processed auth event, used to debounce provider re-fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastChecked {
    /// Provider uid of the event.
    pub uid: String,
    /// When the event was processed.
    pub at: Instant,
}

/// Authentication state published to every subscriber of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    /// Current status.
    pub status: AuthStatus,
    /// Backend user identifier once verified.
    pub user: Option<String>,
    /// Last auth event processed, cleared on every sign-out.
    pub last_checked: Option<LastChecked>,
}

impl AuthSnapshot {
    /// True once the backend confirmed a user.
    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    /// True once any auth event was resolved.
    pub fn is_initialized(&self) -> bool {
        self.status != AuthStatus::Uninitialized
    }
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self {
            status: AuthStatus::Uninitialized,
            user: None,
            last_checked: None,
        }
    }
}

/// Explicitly owned session: the access token, its refresh timer, and the auth state.
///
/// One instance exists per process (or per simulated tab in tests); it is the only writer of the
/// stored token. Call [`SessionManager::teardown`] before dropping the last handle to cancel the
/// refresh timer deterministically.
pub struct SessionManager {
    id: Uuid,
    store: Arc<dyn TokenStore>,
    token: RwLock<Option<SessionToken>>,
    auth: watch::Sender<AuthSnapshot>,
    signals: SignalHub,
    notices: NoticeHub,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    refresh_requested: Arc<Notify>,
}

impl SessionManager {
    /// Construct a new [`SessionManager`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(store: Arc<dyn TokenStore>) -> SharedSession {
        let (auth, _rx) = watch::channel(AuthSnapshot::default());
        Arc::new(Self {
            id: Uuid::new_v4(),
            store,
            token: RwLock::new(None),
            auth,
            signals: SignalHub::new(SIGNAL_CAPACITY),
            notices: NoticeHub::new(NOTICE_CAPACITY),
            refresh_task: Mutex::new(None),
            refresh_requested: Arc::new(Notify::new()),
        })
    }

    /// Identifier stamped on storage writes made by this session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Load a previously persisted token. Undecodable tokens are discarded.
    pub async fn restore(&self) -> Result<Option<SessionToken>, StorageError> {
        let Some(raw) = self.store.load().await? else {
            return Ok(None);
        };
        match SessionToken::decode(raw) {
            Ok(token) => {
                *self.token.write().await = Some(token.clone());
                debug!(subject = ?token.subject(), "restored persisted token");
                Ok(Some(token))
            }
            Err(err) => {
                warn!(error = %err, "discarding undecodable persisted token");
                self.store.remove(self.id).await?;
                Ok(None)
            }
        }
    }

    /// Current token, if one is installed.
    pub async fn token(&self) -> Option<SessionToken> {
        self.token.read().await.clone()
    }

    /// `Authorization` header value for the current token.
    pub async fn bearer(&self) -> Option<String> {
        self.token.read().await.as_ref().map(SessionToken::bearer)
    }

    /// Decode, persist, and publish a freshly minted token.
    pub async fn install_token(&self, raw: String) -> Result<SessionToken, SessionError> {
        let token = SessionToken::decode(raw)?;
        self.store.save(token.as_str().to_owned(), self.id).await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drop the token locally and remove it from storage, notifying other sessions.
    pub async fn clear_token(&self) -> Result<(), StorageError> {
        self.token.write().await.take();
        self.store.remove(self.id).await
    }

    /// Drop the local copy only; used when storage already lost the token.
    pub async fn forget_token(&self) {
        self.token.write().await.take();
    }

    /// Change feed of the underlying token store.
    pub fn storage_events(&self) -> tokio::sync::broadcast::Receiver<StorageEvent> {
        self.store.subscribe()
    }

    /// Current auth state.
    pub fn auth(&self) -> AuthSnapshot {
        self.auth.borrow().clone()
    }

    /// Watch every auth state change.
    pub fn subscribe_auth(&self) -> watch::Receiver<AuthSnapshot> {
        self.auth.subscribe()
    }

    /// Mark the session as confirmed for backend user `user`.
    pub fn set_authenticated(&self, user: impl Into<String>) {
        let user = user.into();
        self.auth.send_modify(|snapshot| {
            snapshot.status = AuthStatus::Authenticated;
            snapshot.user = Some(user);
        });
    }

    /// Mark the session as signed out.
    pub fn set_unauthenticated(&self) {
        self.auth.send_modify(|snapshot| {
            snapshot.status = AuthStatus::Unauthenticated;
            snapshot.user = None;
        });
    }

    /// Record the uid of an auth event about to be processed.
    pub fn mark_checked(&self, uid: impl Into<String>, at: Instant) {
        let uid = uid.into();
        self.auth.send_modify(|snapshot| {
            snapshot.last_checked = Some(LastChecked { uid, at });
        });
    }

    /// Forget the last processed auth event so the next sign-in is checked regardless of timing.
    pub fn clear_checked(&self) {
        self.auth.send_if_modified(|snapshot| snapshot.last_checked.take().is_some());
    }

    /// Hub for session signals.
    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    /// Hub for user-facing notices.
    pub fn notices(&self) -> &NoticeHub {
        &self.notices
    }

    /// Ask the reconciler to end the session after the request layer gave up.
    pub fn raise_auth_required(&self) {
        info!("raising auth-required signal");
        self.signals.broadcast(SessionSignal::AuthRequired);
    }

    /// Replace the proactive refresh task, aborting any previous one.
    pub fn replace_refresh(&self, handle: JoinHandle<()>) {
        let previous = self.lock_refresh().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Abort the proactive refresh task, if one runs.
    pub fn cancel_refresh(&self) {
        if let Some(handle) = self.lock_refresh().take() {
            handle.abort();
            debug!("proactive refresh cancelled");
        }
    }

    /// Wake the refresh task so it renews the token now instead of at its scheduled time.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Handle the refresh task waits on; it does not keep the session alive.
    pub(crate) fn refresh_trigger(&self) -> Arc<Notify> {
        self.refresh_requested.clone()
    }

    /// Cancel every pending timer owned by the session. Safe to call more than once.
    pub fn teardown(&self) {
        self.cancel_refresh();
    }

    fn lock_refresh(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        // A poisoned lock only means a panic happened while swapping handles.
        self.refresh_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::token_store::{MemoryTokenStore, StorageChange};
    use crate::state::token::tests::jwt;

    #[tokio::test]
    async fn install_persists_and_clear_broadcasts_removal() {
        let store = MemoryTokenStore::new();
        let session = SessionManager::new(Arc::new(store.clone()));
        let mut feed = session.storage_events();

        let raw = jwt(serde_json::json!({ "exp": 1_900_000_000, "sub": "u1" }));
        let token = session.install_token(raw.clone()).await.unwrap();
        assert_eq!(token.as_str(), raw);
        assert_eq!(session.bearer().await, Some(format!("Bearer {raw}")));
        assert_eq!(feed.recv().await.unwrap().change, StorageChange::Saved);

        session.clear_token().await.unwrap();
        assert!(session.token().await.is_none());
        let event = feed.recv().await.unwrap();
        assert_eq!(event.change, StorageChange::Removed);
        assert_eq!(event.origin, session.id());
    }

    #[tokio::test]
    async fn install_rejects_garbage_without_persisting() {
        let store = MemoryTokenStore::new();
        let session = SessionManager::new(Arc::new(store.clone()));
        assert!(matches!(
            session.install_token("garbage".into()).await,
            Err(SessionError::Token(_))
        ));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_discards_undecodable_token() {
        let store = MemoryTokenStore::new();
        store.save("garbage".into(), Uuid::nil()).await.unwrap();
        let session = SessionManager::new(Arc::new(store.clone()));

        assert!(session.restore().await.unwrap().is_none());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn teardown_aborts_refresh_task() {
        let session = SessionManager::new(Arc::new(MemoryTokenStore::new()));
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        session.replace_refresh(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        }));

        session.teardown();
        session.teardown();
        // The sender is dropped together with the aborted task.
        assert!(alive_rx.await.is_err());
    }

    #[test]
    fn snapshot_starts_uninitialized() {
        let snapshot = AuthSnapshot::default();
        assert!(!snapshot.is_initialized());
        assert!(!snapshot.is_authenticated());
    }
}
