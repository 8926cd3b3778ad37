//! Client configuration loading: REST endpoint, token location, and the session timing policies.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::services::retry::RetryPolicy;

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "TIMER_ROOMS_CONFIG_PATH";
/// Environment variable that overrides the REST base URL from the file.
const API_URL_ENV: &str = "TIMER_ROOMS_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TOKEN_PATH: &str = ".timer-rooms/access_token";

/// Auth Session Reconciler and request-layer policy.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Window in which a repeated event for the same user is ignored.
    pub debounce: Duration,
    /// Backoff for token acquisition and backend verification.
    pub retry: RetryPolicy,
    /// How long before expiry the token is proactively refreshed.
    pub refresh_lead: Duration,
    /// Extra attempts the request layer makes after a 401 before raising auth-required.
    pub unauthorized_retries: u32,
    /// Routes under this prefix never run account reconciliation.
    pub controller_path_prefix: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            retry: RetryPolicy::new(3, Duration::from_millis(100)),
            refresh_lead: Duration::from_secs(5 * 60),
            unauthorized_retries: 2,
            controller_path_prefix: "/controller".into(),
        }
    }
}

/// Checkout Status Poller policy.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Pause between two status checks.
    pub poll_interval: Duration,
    /// Status checks made before giving up.
    pub max_attempts: u32,
    /// Where to go after success when the redirect carried no `return_url`.
    pub default_return_url: String,
    /// Delay between the success notice and the navigation to the return URL.
    pub redirect_delay: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            max_attempts: 15,
            default_return_url: "/dashboard".into(),
            redirect_delay: Duration::from_millis(2_000),
        }
    }
}

/// Default options for room connections.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Reopen the socket when the link drops.
    pub auto_reconnect: bool,
    /// Pause before each reconnection attempt.
    pub reconnect_interval: Duration,
    /// Reconnection attempts allowed after the initial one.
    pub max_reconnect_attempts: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(3_000),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the client.
pub struct AppConfig {
    /// REST base URL; the room socket endpoint is derived from it.
    pub api_base_url: String,
    /// File the access token is persisted to.
    pub token_path: PathBuf,
    /// Session reconciliation and request-layer policy.
    pub auth: AuthSettings,
    /// Checkout confirmation policy.
    pub checkout: CheckoutSettings,
    /// Room connection defaults.
    pub room: RoomSettings,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    info!(path = %path.display(), "loaded client config");
                    raw.into()
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        if let Some(url) = env::var(API_URL_ENV).ok().filter(|url| !url.is_empty()) {
            info!(%url, "using API base URL from environment");
            config.api_base_url = url;
        }
        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            token_path: PathBuf::from(DEFAULT_TOKEN_PATH),
            auth: AuthSettings::default(),
            checkout: CheckoutSettings::default(),
            room: RoomSettings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    api_base_url: Option<String>,
    token_path: Option<PathBuf>,
    controller_path_prefix: Option<String>,
    auth: RawAuth,
    checkout: RawCheckout,
    room: RawRoom,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAuth {
    debounce_ms: Option<u64>,
    retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    refresh_lead_secs: Option<u64>,
    unauthorized_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCheckout {
    poll_interval_ms: Option<u64>,
    max_attempts: Option<u32>,
    default_return_url: Option<String>,
    redirect_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRoom {
    auto_reconnect: Option<bool>,
    reconnect_interval_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = AppConfig::default();
        let auth = AuthSettings {
            debounce: value
                .auth
                .debounce_ms
                .map_or(defaults.auth.debounce, Duration::from_millis),
            retry: RetryPolicy::new(
                value.auth.retries.unwrap_or(defaults.auth.retry.retries),
                value
                    .auth
                    .initial_backoff_ms
                    .map_or(defaults.auth.retry.initial_delay, Duration::from_millis),
            ),
            refresh_lead: value
                .auth
                .refresh_lead_secs
                .map_or(defaults.auth.refresh_lead, Duration::from_secs),
            unauthorized_retries: value
                .auth
                .unauthorized_retries
                .unwrap_or(defaults.auth.unauthorized_retries),
            controller_path_prefix: value
                .controller_path_prefix
                .unwrap_or(defaults.auth.controller_path_prefix),
        };
        let checkout = CheckoutSettings {
            poll_interval: value
                .checkout
                .poll_interval_ms
                .map_or(defaults.checkout.poll_interval, Duration::from_millis),
            max_attempts: value
                .checkout
                .max_attempts
                .unwrap_or(defaults.checkout.max_attempts),
            default_return_url: value
                .checkout
                .default_return_url
                .unwrap_or(defaults.checkout.default_return_url),
            redirect_delay: value
                .checkout
                .redirect_delay_ms
                .map_or(defaults.checkout.redirect_delay, Duration::from_millis),
        };
        let room = RoomSettings {
            auto_reconnect: value.room.auto_reconnect.unwrap_or(defaults.room.auto_reconnect),
            reconnect_interval: value
                .room
                .reconnect_interval_ms
                .map_or(defaults.room.reconnect_interval, Duration::from_millis),
            max_reconnect_attempts: value
                .room
                .max_reconnect_attempts
                .unwrap_or(defaults.room.max_reconnect_attempts),
        };

        Self {
            api_base_url: value.api_base_url.unwrap_or(defaults.api_base_url),
            token_path: value.token_path.unwrap_or(defaults.token_path),
            auth,
            checkout,
            room,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
