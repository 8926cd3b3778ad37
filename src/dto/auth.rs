use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::dto::{string_or_number, validation::validate_password};

/// Credentials posted to the form-encoded login endpoint.
#[derive(Debug, Clone, Validate)]
pub struct LoginForm {
    /// Account email, also sent as the OAuth2 `username`.
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    /// Plain-text password; only ever sent over the login request.
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

impl LoginForm {
    /// OAuth2 password-flow field names expected by the backend.
    pub(crate) fn as_form(&self) -> [(&'static str, &str); 2] {
        [("username", &self.email), ("password", &self.password)]
    }
}

/// Payload for account registration.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct RegisterForm {
    /// Email the account is registered under.
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    /// Password checked against the local strength rule before submission.
    #[validate(custom(function = "validate_password"))]
    pub password: String,
    /// Display name.
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    pub full_name: String,
}

/// Access token returned by the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    /// Raw JWT.
    pub access_token: String,
    /// Token scheme, `bearer` unless the backend says otherwise.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".into()
}

/// Authenticated user as returned by `/api/v1/user/me/` and registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    /// Backend user identifier.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Account email.
    pub email: String,
    /// Display name, when one was provided at registration.
    #[serde(default)]
    pub full_name: Option<String>,
    /// Whether the account is enabled.
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}
