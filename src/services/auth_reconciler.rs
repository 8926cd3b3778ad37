//! Bridges the identity provider's auth-state stream with the session token and backend
//! verification.
//!
//! A failed acquisition or verification never signs an authenticated user out. Only an explicit
//! provider sign-out, a removal of the stored token by another session, or the request layer's
//! [`SessionSignal::AuthRequired`] end the session.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use time::OffsetDateTime;
use tokio::{
    sync::{Notify, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::AuthSettings,
    dto::auth::UserProfile,
    error::AuthError,
    services::{
        identity::{IdentityProvider, IdentityUser, RouteScope, SessionVerifier},
        retry::{RetryPolicy, retry_with_backoff},
    },
    state::{RefreshSchedule, SessionManager, SessionSignal, SharedSession},
};

/// Floor between two proactive refreshes.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How a single identity event was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Controller routes use room-scoped tokens; nothing was checked.
    ControllerRoute,
    /// The provider reported no signed-in user.
    SignedOut,
    /// Same user seen within the debounce window.
    Debounced,
    /// The backend confirmed the session.
    Authenticated {
        /// Backend user identifier.
        user_id: String,
    },
    /// Acquisition or verification failed after retries; the previous state was kept.
    Unconfirmed,
}

/// Reconciles identity-provider events into the session's auth state.
pub struct AuthReconciler {
    session: SharedSession,
    provider: Arc<dyn IdentityProvider>,
    verifier: Arc<dyn SessionVerifier>,
    settings: AuthSettings,
    scope: RouteScope,
}

impl AuthReconciler {
    /// Reconciler for `session`, minting tokens with `provider` and confirming them with `verifier`.
    pub fn new(
        session: SharedSession,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn SessionVerifier>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            session,
            provider,
            verifier,
            settings,
            scope: RouteScope::Account,
        }
    }

    /// Update the route the application is currently showing.
    pub fn set_route(&mut self, path: &str) {
        self.scope = RouteScope::from_path(path, &self.settings.controller_path_prefix);
    }

    /// Session this reconciler writes to.
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Process identity events in arrival order until the provider stream closes.
    ///
    /// Invalidations (storage removal by another session, auth-required) are handled by a
    /// watcher task so they apply immediately even while an event is being verified.
    pub async fn run(mut self, mut events: mpsc::Receiver<Option<IdentityUser>>) {
        let watcher = watch_invalidations(self.session.clone());
        while let Some(user) = events.recv().await {
            let outcome = self.handle_identity_event(user).await;
            debug!(?outcome, "identity event reconciled");
        }
        watcher.abort();
        self.session.teardown();
        info!("identity stream closed; reconciler stopped");
    }

    /// Reconcile one auth-state event: `Some` for a signed-in user, `None` for sign-out.
    pub async fn handle_identity_event(&mut self, user: Option<IdentityUser>) -> ReconcileOutcome {
        if self.scope == RouteScope::Controller {
            self.session.cancel_refresh();
            self.session.set_unauthenticated();
            return ReconcileOutcome::ControllerRoute;
        }

        let Some(user) = user else {
            self.session.cancel_refresh();
            self.session.clear_checked();
            if let Err(err) = self.session.clear_token().await {
                warn!(error = %err, "failed to remove stored token on sign-out");
            }
            self.session.set_unauthenticated();
            info!("identity provider reported sign-out");
            return ReconcileOutcome::SignedOut;
        };

        let now = Instant::now();
        if let Some(last) = self.session.auth().last_checked {
            if last.uid == user.uid && now.duration_since(last.at) < self.settings.debounce {
                debug!(uid = %user.uid, "duplicate identity event ignored");
                return ReconcileOutcome::Debounced;
            }
        }
        self.session.mark_checked(user.uid.clone(), now);
        self.session.cancel_refresh();

        match self.confirm(&user).await {
            Ok(profile) => {
                info!(uid = %user.uid, user_id = %profile.id, "session verified");
                self.session.set_authenticated(profile.id.clone());
                self.schedule_refresh(user);
                ReconcileOutcome::Authenticated {
                    user_id: profile.id,
                }
            }
            Err(err) => {
                let snapshot = self.session.auth();
                warn!(
                    uid = %user.uid,
                    error = %err,
                    authenticated = snapshot.is_authenticated(),
                    "could not confirm session; keeping current auth state"
                );
                if !snapshot.is_initialized() {
                    self.session.set_unauthenticated();
                }
                ReconcileOutcome::Unconfirmed
            }
        }
    }

    async fn confirm(&self, user: &IdentityUser) -> Result<UserProfile, AuthError> {
        let policy = self.settings.retry;
        let raw = retry_with_backoff(policy, "token acquisition", || {
            self.provider.id_token(user, true)
        })
        .await
        .map_err(AuthError::Provider)?;

        let token = self
            .session
            .install_token(raw)
            .await
            .map_err(AuthError::Install)?;

        retry_with_backoff(policy, "session verification", || {
            self.verifier.verify(token.bearer())
        })
        .await
        .map_err(AuthError::Verification)
    }

    fn schedule_refresh(&self, user: IdentityUser) {
        let handle = tokio::spawn(run_refresh_loop(
            Arc::downgrade(&self.session),
            self.session.refresh_trigger(),
            self.provider.clone(),
            user,
            self.settings.retry,
            self.settings.refresh_lead,
        ));
        self.session.replace_refresh(handle);
    }
}

/// Keep renewing the token ahead of its expiry until the session goes away or a refresh fails.
async fn run_refresh_loop(
    session: Weak<SessionManager>,
    trigger: Arc<Notify>,
    provider: Arc<dyn IdentityProvider>,
    user: IdentityUser,
    policy: RetryPolicy,
    lead: Duration,
) {
    let mut last_refresh: Option<Instant> = None;
    loop {
        let schedule = {
            let Some(session) = session.upgrade() else {
                return;
            };
            let Some(token) = session.token().await else {
                return;
            };
            RefreshSchedule::for_token(&token, OffsetDateTime::now_utc(), lead)
        };

        let mut delay = match schedule {
            RefreshSchedule::Immediate => Duration::ZERO,
            RefreshSchedule::After(delay) => delay,
            RefreshSchedule::Never => Duration::MAX,
        };
        if let Some(last) = last_refresh {
            delay = delay.max(MIN_REFRESH_INTERVAL.saturating_sub(last.elapsed()));
        }

        if delay == Duration::MAX {
            trigger.notified().await;
        } else if !delay.is_zero() {
            debug!(?delay, "proactive refresh scheduled");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = trigger.notified() => debug!("refresh requested early"),
            }
        }

        let raw = match retry_with_backoff(policy, "token refresh", || {
            provider.id_token(&user, true)
        })
        .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(uid = %user.uid, error = %err, "proactive refresh failed; keeping current token");
                return;
            }
        };

        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(err) = session.install_token(raw).await {
            warn!(uid = %user.uid, error = %err, "refreshed token rejected; keeping current token");
            return;
        }
        session.signals().broadcast(SessionSignal::TokenRefreshed);
        info!(uid = %user.uid, "session token refreshed");
        last_refresh = Some(Instant::now());
    }
}

/// Deauthenticate immediately when another session removes the stored token or when the
/// request layer raises auth-required.
pub fn watch_invalidations(session: SharedSession) -> JoinHandle<()> {
    let mut storage = session.storage_events();
    let mut signals = session.signals().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = storage.recv() => match event {
                    Ok(event) if event.is_removal_from_other(session.id()) => {
                        info!(origin = %event.origin, "stored token removed by another session");
                        session.cancel_refresh();
                        session.clear_checked();
                        session.forget_token().await;
                        session.set_unauthenticated();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "storage change feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                signal = signals.recv() => match signal {
                    Ok(SessionSignal::AuthRequired) => {
                        info!("auth required; ending session");
                        session.cancel_refresh();
                        session.clear_checked();
                        if let Err(err) = session.clear_token().await {
                            warn!(error = %err, "failed to remove stored token");
                        }
                        session.set_unauthenticated();
                    }
                    Ok(SessionSignal::TokenRefreshed) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session signal feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use futures::future::BoxFuture;
    use reqwest::StatusCode;

    use super::*;
    use crate::{
        dao::token_store::{MemoryTokenStore, TokenStore},
        error::{ApiError, ProviderError},
        state::{AuthStatus, token::tests::jwt},
    };

    struct FakeProvider {
        calls: AtomicU32,
        fail: AtomicBool,
        expires_in: i64,
    }

    impl FakeProvider {
        fn new(expires_in: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                expires_in,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IdentityProvider for FakeProvider {
        fn id_token(
            &self,
            user: &IdentityUser,
            _force_refresh: bool,
        ) -> BoxFuture<'static, Result<String, ProviderError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(ProviderError("network down".into()))
            } else {
                let exp = OffsetDateTime::now_utc().unix_timestamp() + self.expires_in;
                Ok(jwt(serde_json::json!({ "sub": user.uid, "exp": exp })))
            };
            Box::pin(async move { result })
        }
    }

    struct FakeVerifier {
        calls: AtomicU32,
        fail: AtomicBool,
    }

    impl FakeVerifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    impl SessionVerifier for FakeVerifier {
        fn verify(&self, bearer: String) -> BoxFuture<'static, Result<UserProfile, ApiError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            Box::pin(async move {
                assert!(bearer.starts_with("Bearer "));
                if fail {
                    Err(ApiError::Status {
                        path: "/api/v1/user/me/".into(),
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        body: String::new(),
                    })
                } else {
                    Ok(UserProfile {
                        id: "42".into(),
                        email: "ada@example.com".into(),
                        full_name: None,
                        is_active: true,
                    })
                }
            })
        }
    }

    const HOUR: i64 = 3600;

    fn reconciler(
        store: &MemoryTokenStore,
        provider: &Arc<FakeProvider>,
        verifier: &Arc<FakeVerifier>,
    ) -> AuthReconciler {
        AuthReconciler::new(
            SessionManager::new(Arc::new(store.clone())),
            provider.clone(),
            verifier.clone(),
            AuthSettings::default(),
        )
    }

    fn ada() -> Option<IdentityUser> {
        Some(IdentityUser::new("firebase-ada"))
    }

    #[tokio::test(start_paused = true)]
    async fn successful_event_authenticates_and_persists_token() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);

        let outcome = reconciler.handle_identity_event(ada()).await;

        assert_eq!(
            outcome,
            ReconcileOutcome::Authenticated {
                user_id: "42".into()
            }
        );
        let auth = reconciler.session().auth();
        assert_eq!(auth.status, AuthStatus::Authenticated);
        assert_eq!(auth.user.as_deref(), Some("42"));
        assert!(store.load().await.unwrap().is_some());
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_event_within_window_is_ignored() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);

        reconciler.handle_identity_event(ada()).await;
        sleep(Duration::from_millis(499)).await;
        assert_eq!(
            reconciler.handle_identity_event(ada()).await,
            ReconcileOutcome::Debounced
        );
        assert_eq!(provider.calls(), 1);

        sleep(Duration::from_millis(1)).await;
        assert!(matches!(
            reconciler.handle_identity_event(ada()).await,
            ReconcileOutcome::Authenticated { .. }
        ));
        assert_eq!(provider.calls(), 2);

        // A different user is never debounced.
        assert!(matches!(
            reconciler
                .handle_identity_event(Some(IdentityUser::new("firebase-bob")))
                .await,
            ReconcileOutcome::Authenticated { .. }
        ));
        assert_eq!(provider.calls(), 3);
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_after_sign_out_is_not_debounced() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);

        reconciler.handle_identity_event(ada()).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            reconciler.handle_identity_event(None).await,
            ReconcileOutcome::SignedOut
        );
        assert!(reconciler.session().auth().last_checked.is_none());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            reconciler.handle_identity_event(ada()).await,
            ReconcileOutcome::Authenticated {
                user_id: "42".into()
            }
        );
        assert_eq!(provider.calls(), 2);
        assert!(reconciler.session().auth().is_authenticated());
        assert!(store.load().await.unwrap().is_some());
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_failure_keeps_authenticated_session() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        reconciler.handle_identity_event(ada()).await;

        provider.fail.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(500)).await;
        let started = Instant::now();
        let outcome = reconciler.handle_identity_event(ada()).await;

        assert_eq!(outcome, ReconcileOutcome::Unconfirmed);
        // 1 initial call + 1 attempt and 3 retries backing off 100, 200, 400 ms.
        assert_eq!(provider.calls(), 5);
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(reconciler.session().auth().status, AuthStatus::Authenticated);
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn verification_failure_keeps_authenticated_session() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        reconciler.handle_identity_event(ada()).await;

        verifier.fail.store(true, Ordering::SeqCst);
        let outcome = reconciler
            .handle_identity_event(Some(IdentityUser::new("firebase-bob")))
            .await;

        assert_eq!(outcome, ReconcileOutcome::Unconfirmed);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1 + 4);
        assert!(reconciler.session().auth().is_authenticated());
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_before_first_resolution_initializes_as_unauthenticated() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        provider.fail.store(true, Ordering::SeqCst);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);

        assert_eq!(
            reconciler.handle_identity_event(ada()).await,
            ReconcileOutcome::Unconfirmed
        );
        assert_eq!(
            reconciler.session().auth().status,
            AuthStatus::Unauthenticated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn controller_routes_short_circuit() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        reconciler.set_route("/controller/42");

        assert_eq!(
            reconciler.handle_identity_event(ada()).await,
            ReconcileOutcome::ControllerRoute
        );
        assert_eq!(provider.calls(), 0);
        let auth = reconciler.session().auth();
        assert!(auth.is_initialized());
        assert!(!auth.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_sign_out_clears_token() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        reconciler.handle_identity_event(ada()).await;

        assert_eq!(
            reconciler.handle_identity_event(None).await,
            ReconcileOutcome::SignedOut
        );
        assert!(store.load().await.unwrap().is_none());
        assert!(reconciler.session().token().await.is_none());
        assert_eq!(
            reconciler.session().auth().status,
            AuthStatus::Unauthenticated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_near_expiry_is_refreshed_immediately() {
        let store = MemoryTokenStore::new();
        // Expires in three minutes, inside the five minute lead.
        let provider = FakeProvider::new(180);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        let mut signals = reconciler.session().signals().subscribe();

        reconciler.handle_identity_event(ada()).await;
        assert_eq!(provider.calls(), 1);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(signals.recv().await.unwrap(), SessionSignal::TokenRefreshed);

        // The follow-up refresh waits at least the minimum interval.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.calls(), 2);
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn token_far_from_expiry_is_not_refreshed_early() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);

        reconciler.handle_identity_event(ada()).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.calls(), 1);

        reconciler.session().request_refresh();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(provider.calls(), 2);
        reconciler.session().teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn storage_removal_signs_out_other_sessions() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut tab_a = reconciler(&store, &provider, &verifier);
        let mut tab_b = reconciler(&store, &provider, &verifier);
        let watcher_a = watch_invalidations(tab_a.session().clone());
        let watcher_b = watch_invalidations(tab_b.session().clone());

        tab_a.handle_identity_event(ada()).await;
        tab_b.handle_identity_event(ada()).await;
        assert!(tab_b.session().auth().is_authenticated());

        tab_a.handle_identity_event(None).await;

        let mut auth_b = tab_b.session().subscribe_auth();
        tokio::time::timeout(
            Duration::from_millis(1),
            auth_b.wait_for(|auth| auth.status == AuthStatus::Unauthenticated),
        )
        .await
        .expect("other session should sign out within one turn")
        .unwrap();
        assert!(tab_b.session().token().await.is_none());
        assert!(tab_b.session().auth().last_checked.is_none());

        watcher_a.abort();
        watcher_b.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_required_signal_ends_session() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let mut reconciler = reconciler(&store, &provider, &verifier);
        let watcher = watch_invalidations(reconciler.session().clone());
        reconciler.handle_identity_event(ada()).await;

        reconciler.session().raise_auth_required();

        let mut auth = reconciler.session().subscribe_auth();
        tokio::time::timeout(
            Duration::from_millis(1),
            auth.wait_for(|auth| auth.status == AuthStatus::Unauthenticated),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(reconciler.session().auth().last_checked.is_none());
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_events_in_order_and_stops_on_close() {
        let store = MemoryTokenStore::new();
        let provider = FakeProvider::new(HOUR);
        let verifier = FakeVerifier::new();
        let reconciler = reconciler(&store, &provider, &verifier);
        let session = reconciler.session().clone();
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(reconciler.run(rx));
        tx.send(ada()).await.unwrap();
        tx.send(None).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(session.auth().status, AuthStatus::Unauthenticated);
        assert!(store.load().await.unwrap().is_none());
    }
}
