use serde::Deserialize;

/// Response of the subscription status endpoint polled after checkout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionStatus {
    /// Provider status string such as `active` or `incomplete`.
    pub status: String,
    /// Backend subscription identifier once one is attached.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Plan name, when known.
    #[serde(default)]
    pub plan: Option<String>,
}

impl SubscriptionStatus {
    /// Active means the payment provider confirmed and the backend attached a subscription.
    pub fn is_active(&self) -> bool {
        self.active_subscription().is_some()
    }

    /// Subscription identifier, only once the subscription is active.
    pub fn active_subscription(&self) -> Option<&str> {
        self.subscription_id
            .as_deref()
            .filter(|_| self.status == "active")
    }
}
