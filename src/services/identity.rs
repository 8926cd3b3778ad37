use futures::future::BoxFuture;

use crate::{
    dto::auth::UserProfile,
    error::{ApiError, ProviderError},
};

/// Opaque user handle delivered by the identity provider's auth-state stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityUser {
    /// Provider-side user identifier.
    pub uid: String,
    /// Email known to the provider, if shared.
    pub email: Option<String>,
}

impl IdentityUser {
    /// User handle with only a uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
        }
    }
}

/// External identity provider minting ID tokens for a signed-in user.
pub trait IdentityProvider: Send + Sync {
    /// Return an ID token for `user`; `force_refresh` bypasses any provider-side cache.
    fn id_token(
        &self,
        user: &IdentityUser,
        force_refresh: bool,
    ) -> BoxFuture<'static, Result<String, ProviderError>>;
}

/// Backend confirmation that a token belongs to a known, active user.
pub trait SessionVerifier: Send + Sync {
    /// Resolve the profile `bearer` belongs to, failing when the backend rejects it.
    fn verify(&self, bearer: String) -> BoxFuture<'static, Result<UserProfile, ApiError>>;
}

/// Whether the current route takes part in account authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    /// Regular account pages.
    Account,
    /// Room controller surfaces authenticate with a room-scoped token instead.
    Controller,
}

impl RouteScope {
    /// Classify `path`, treating everything under `controller_prefix` as a controller route.
    pub fn from_path(path: &str, controller_prefix: &str) -> Self {
        let prefix = controller_prefix.trim_end_matches('/');
        let is_controller = path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
        if is_controller {
            RouteScope::Controller
        } else {
            RouteScope::Account
        }
    }
}
