use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{
    Client, Method, RequestBuilder, Response, StatusCode, header::AUTHORIZATION,
};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    config::AuthSettings,
    dto::{
        auth::{AccessToken, LoginForm, RegisterForm, UserProfile},
        subscription::SubscriptionStatus,
    },
    error::{ApiError, ApiResult, FormError},
    services::{
        checkout_poller::SubscriptionStatusSource, identity::SessionVerifier, retry::RetryPolicy,
    },
    state::SharedSession,
};

const LOGIN_PATH: &str = "/api/v1/login";
const LOGOUT_PATH: &str = "/api/v1/logout";
const REGISTER_PATH: &str = "/api/v1/user";
const ME_PATH: &str = "/api/v1/user/me/";
const SUBSCRIPTION_STATUS_PATH: &str = "/api/v1/subscriptions/status";

/// REST client for the timer-rooms backend.
///
/// Authorized calls attach the session's bearer token. A `401` is retried after asking the
/// session for a fresh token; once the retry budget is spent the client raises
/// [`SessionSignal::AuthRequired`](crate::state::SessionSignal::AuthRequired) and leaves
/// deauthentication to whoever listens for it.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Arc<str>,
    session: SharedSession,
    unauthorized_retries: u32,
    backoff: RetryPolicy,
}

impl ApiClient {
    /// Client for `base_url` whose requests authenticate with `session`.
    pub fn new(
        base_url: impl AsRef<str>,
        session: SharedSession,
        settings: &AuthSettings,
    ) -> ApiResult<Self> {
        let http = Client::builder()
            .build()
            .map_err(|source| ApiError::ClientBuilder { source })?;
        Ok(Self {
            http,
            base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
            session,
            unauthorized_retries: settings.unauthorized_retries,
            backoff: settings.retry,
        })
    }

    /// REST base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session whose token authorizes requests.
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Exchange credentials for an access token, then load the profile it belongs to.
    pub async fn login(&self, form: &LoginForm) -> Result<UserProfile, FormError> {
        form.validate()?;
        let response = self
            .http
            .post(self.url(LOGIN_PATH))
            .form(&form.as_form())
            .send()
            .await
            .map_err(|source| request_error(LOGIN_PATH, source))?;
        let token: AccessToken = decode(LOGIN_PATH, response).await?;
        debug!(token_type = %token.token_type, "login accepted");

        self.session
            .install_token(token.access_token)
            .await
            .map_err(ApiError::from)?;
        let profile = self.me().await?;
        self.session.set_authenticated(profile.id.clone());
        info!(user_id = %profile.id, "logged in");
        Ok(profile)
    }

    /// Tell the backend the session ended; the local token is removed whatever it answers.
    pub async fn logout(&self) -> ApiResult<()> {
        let result = async {
            let response = self
                .with_session_bearer(self.http.post(self.url(LOGOUT_PATH)))
                .await
                .send()
                .await
                .map_err(|source| request_error(LOGOUT_PATH, source))?;
            ensure_success(LOGOUT_PATH, response).await
        }
        .await;

        self.session.cancel_refresh();
        self.session.clear_token().await.map_err(|err| ApiError::Session(err.into()))?;
        self.session.set_unauthenticated();
        if let Err(err) = &result {
            warn!(error = %err, "backend logout failed; local session cleared anyway");
        }
        result
    }

    /// Create an account. The new user still has to log in.
    pub async fn register(&self, form: &RegisterForm) -> Result<UserProfile, FormError> {
        form.validate()?;
        let response = self
            .http
            .post(self.url(REGISTER_PATH))
            .json(form)
            .send()
            .await
            .map_err(|source| request_error(REGISTER_PATH, source))?;
        let profile: UserProfile = decode(REGISTER_PATH, response).await?;
        info!(user_id = %profile.id, "account registered");
        Ok(profile)
    }

    /// Profile of the user owning the current session token.
    pub async fn me(&self) -> ApiResult<UserProfile> {
        let response = self.send_authorized(Method::GET, ME_PATH, &[]).await?;
        decode(ME_PATH, response).await
    }

    /// Current subscription status, optionally narrowed to a checkout session.
    pub async fn subscription_status(
        &self,
        session_id: Option<&str>,
    ) -> ApiResult<SubscriptionStatus> {
        let query: Vec<(&str, &str)> = session_id
            .map(|id| vec![("session_id", id)])
            .unwrap_or_default();
        let response = self
            .send_authorized(Method::GET, SUBSCRIPTION_STATUS_PATH, &query)
            .await?;
        decode(SUBSCRIPTION_STATUS_PATH, response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn with_session_bearer(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.bearer().await {
            Some(bearer) => builder.header(AUTHORIZATION, bearer),
            None => builder,
        }
    }

    async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> ApiResult<Response> {
        let mut retry = 0;
        loop {
            let builder = self.http.request(method.clone(), self.url(path)).query(query);
            let response = self
                .with_session_bearer(builder)
                .await
                .send()
                .await
                .map_err(|source| request_error(path, source))?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if retry >= self.unauthorized_retries {
                warn!(path, retries = retry, "still unauthorized after retries");
                self.session.raise_auth_required();
                return Err(ApiError::Unauthorized { path: path.into() });
            }

            let delay = self.backoff.delay_for(retry);
            debug!(path, attempt = retry + 1, ?delay, "unauthorized; refreshing token before retry");
            self.session.request_refresh();
            sleep(delay).await;
            retry += 1;
        }
    }
}

impl SessionVerifier for ApiClient {
    /// Verification never raises auth-required: a rejected fresh token must not end the session.
    fn verify(&self, bearer: String) -> BoxFuture<'static, Result<UserProfile, ApiError>> {
        let client = self.clone();
        Box::pin(async move {
            let response = client
                .http
                .get(client.url(ME_PATH))
                .header(AUTHORIZATION, bearer)
                .send()
                .await
                .map_err(|source| request_error(ME_PATH, source))?;
            decode(ME_PATH, response).await
        })
    }
}

impl SubscriptionStatusSource for ApiClient {
    fn fetch_status(
        &self,
        session_id: Option<String>,
    ) -> BoxFuture<'static, ApiResult<SubscriptionStatus>> {
        let client = self.clone();
        Box::pin(async move { client.subscription_status(session_id.as_deref()).await })
    }
}

fn request_error(path: &str, source: reqwest::Error) -> ApiError {
    ApiError::Request {
        path: path.into(),
        source,
    }
}

async fn status_error(path: &str, response: Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation {
            path: path.into(),
            body,
        },
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized { path: path.into() },
        status => ApiError::Status {
            path: path.into(),
            status,
            body,
        },
    }
}

async fn ensure_success(path: &str, response: Response) -> ApiResult<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(status_error(path, response).await)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> ApiResult<T> {
    if !response.status().is_success() {
        return Err(status_error(path, response).await);
    }
    response.json::<T>().await.map_err(|source| ApiError::Decode {
        path: path.into(),
        source,
    })
}
