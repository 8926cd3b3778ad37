//! Subscription status polling after a payment provider redirect.
//!
//! Attempts are strictly sequential: the next one is scheduled only once the previous request
//! completed, `poll_interval` later. Failed requests and non-active answers consume attempts
//! the same way.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Url;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    config::CheckoutSettings,
    dto::subscription::SubscriptionStatus,
    error::{ApiResult, CheckoutError},
    state::{Notice, NoticeHub},
};

/// Base used to resolve app-relative redirect targets such as `/checkout/success?session_id=..`.
const RELATIVE_BASE: &str = "http://localhost/";

/// Anything able to report the current subscription status.
pub trait SubscriptionStatusSource: Send + Sync {
    /// Fetch the status, scoped to the checkout `session_id` when one is known.
    fn fetch_status(
        &self,
        session_id: Option<String>,
    ) -> BoxFuture<'static, ApiResult<SubscriptionStatus>>;
}

/// Inputs of a checkout poll, as carried by the redirect back from the payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Payment provider checkout session, when the redirect carried one.
    pub session_id: Option<String>,
    /// Where to send the user once the subscription is active.
    pub return_url: String,
}

impl CheckoutRequest {
    /// Request for an explicit session and return URL.
    pub fn new(session_id: Option<String>, return_url: impl Into<String>) -> Self {
        Self {
            session_id,
            return_url: return_url.into(),
        }
    }

    /// Read `session_id` and `return_url` from the redirect URL query.
    pub fn from_redirect(url: &str, settings: &CheckoutSettings) -> Result<Self, CheckoutError> {
        let parsed = Url::parse(url)
            .or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(url)))
            .map_err(|err| CheckoutError::InvalidRedirect {
                url: url.into(),
                reason: err.to_string(),
            })?;

        let mut session_id = None;
        let mut return_url = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "session_id" if !value.is_empty() => session_id = Some(value.into_owned()),
                "return_url" if !value.is_empty() => return_url = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            session_id,
            return_url: return_url.unwrap_or_else(|| settings.default_return_url.clone()),
        })
    }
}

/// Progress published while a checkout poll runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutUpdate {
    /// A status request is in flight.
    Polling {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// The subscription is active.
    Succeeded {
        /// Identifier of the activated subscription.
        subscription_id: String,
    },
    /// Attempts exhausted without an active subscription; payment may still be processing.
    Pending,
    /// Attempts exhausted and at least one request failed outright.
    Failed,
    /// Navigate to the given URL.
    Redirect(String),
}

/// Terminal result of a checkout poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// The subscription became active.
    Succeeded {
        /// Identifier of the activated subscription.
        subscription_id: String,
    },
    /// Still not active after the last attempt.
    Pending,
    /// Not confirmed and at least one status request failed.
    Failed,
}

/// Spawns checkout polls against a [`SubscriptionStatusSource`].
pub struct CheckoutPoller {
    source: Arc<dyn SubscriptionStatusSource>,
    settings: CheckoutSettings,
    notices: NoticeHub,
}

impl CheckoutPoller {
    /// Poller querying `source` and announcing results on `notices`.
    pub fn new(
        source: Arc<dyn SubscriptionStatusSource>,
        settings: CheckoutSettings,
        notices: NoticeHub,
    ) -> Self {
        Self {
            source,
            settings,
            notices,
        }
    }

    /// Start polling in the background. Dropping the handle stops the poll.
    pub fn spawn(&self, request: CheckoutRequest) -> CheckoutHandle {
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_subscription(
            self.source.clone(),
            request,
            self.settings.clone(),
            self.notices.clone(),
            updates_tx,
        ));
        CheckoutHandle { updates, task }
    }
}

/// Owner of a running checkout poll; aborts it when cancelled or dropped.
pub struct CheckoutHandle {
    updates: mpsc::UnboundedReceiver<CheckoutUpdate>,
    task: JoinHandle<CheckoutOutcome>,
}

impl CheckoutHandle {
    /// Next progress update; `None` once the poll finished or was cancelled.
    pub async fn next_update(&mut self) -> Option<CheckoutUpdate> {
        self.updates.recv().await
    }

    /// Wait for the terminal outcome. `None` when the poll was cancelled.
    pub async fn outcome(mut self) -> Option<CheckoutOutcome> {
        (&mut self.task).await.ok()
    }

    /// Stop polling now. No further updates are published.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for CheckoutHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_subscription(
    source: Arc<dyn SubscriptionStatusSource>,
    request: CheckoutRequest,
    settings: CheckoutSettings,
    notices: NoticeHub,
    updates: mpsc::UnboundedSender<CheckoutUpdate>,
) -> CheckoutOutcome {
    let mut saw_failure = false;

    for attempt in 1..=settings.max_attempts {
        if attempt > 1 {
            sleep(settings.poll_interval).await;
        }
        let _ = updates.send(CheckoutUpdate::Polling { attempt });

        match source.fetch_status(request.session_id.clone()).await {
            Ok(status) => match status.active_subscription() {
                Some(subscription_id) => {
                    let subscription_id = subscription_id.to_owned();
                    info!(attempt, %subscription_id, "subscription active");
                    notices.broadcast(Notice::Success(
                        "Your subscription is now active".into(),
                    ));
                    let _ = updates.send(CheckoutUpdate::Succeeded {
                        subscription_id: subscription_id.clone(),
                    });

                    sleep(settings.redirect_delay).await;
                    let _ = updates.send(CheckoutUpdate::Redirect(request.return_url.clone()));
                    return CheckoutOutcome::Succeeded { subscription_id };
                }
                None => debug!(attempt, status = %status.status, "subscription not active yet"),
            },
            Err(err) => {
                saw_failure = true;
                warn!(attempt, error = %err, "subscription status request failed");
            }
        }
    }

    if saw_failure {
        warn!(attempts = settings.max_attempts, "checkout polling failed");
        notices.broadcast(Notice::Error(
            "We could not confirm your subscription. Please try again.".into(),
        ));
        let _ = updates.send(CheckoutUpdate::Failed);
        CheckoutOutcome::Failed
    } else {
        info!(attempts = settings.max_attempts, "subscription still pending");
        notices.broadcast(Notice::Info(
            "Your payment is still being processed. Check back shortly.".into(),
        ));
        let _ = updates.send(CheckoutUpdate::Pending);
        CheckoutOutcome::Pending
    }
}
