use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;

/// Failures while decoding a bearer token's claims.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token does not have exactly three segments.
    #[error("token is not a three-part JWT")]
    Format,
    /// The payload segment is not base64url.
    #[error("token payload is not valid base64url")]
    Encoding(#[source] base64::DecodeError),
    /// The payload is not a JSON claims object.
    #[error("token payload is not valid JSON")]
    Claims(#[source] serde_json::Error),
    /// The `exp` claim is not a representable timestamp.
    #[error("token expiry {0} is out of range")]
    Expiry(i64),
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    sub: Option<String>,
}

/// Opaque bearer credential together with the claims needed to schedule its refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    raw: String,
    expires_at: Option<OffsetDateTime>,
    subject: Option<String>,
}

impl SessionToken {
    /// Decode the payload segment without verifying the signature; the backend does that.
    pub fn decode(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        let mut parts = raw.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Format);
        };

        // Some issuers pad the segment even though JWT forbids it.
        let payload = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(TokenError::Encoding)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(TokenError::Claims)?;
        let expires_at = claims
            .exp
            .map(|exp| OffsetDateTime::from_unix_timestamp(exp).map_err(|_| TokenError::Expiry(exp)))
            .transpose()?;

        Ok(Self {
            raw,
            expires_at,
            subject: claims.sub,
        })
    }

    /// Raw token as issued.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Expiry from the `exp` claim.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    /// Subject from the `sub` claim.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.raw)
    }
}

/// When the next proactive refresh should happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    /// The token is already inside the refresh lead window (or expired).
    Immediate,
    /// Refresh once this much time has passed.
    After(Duration),
    /// The token carries no expiry claim.
    Never,
}

impl RefreshSchedule {
    /// Schedule a refresh `lead` before the token expires.
    pub fn for_token(token: &SessionToken, now: OffsetDateTime, lead: Duration) -> Self {
        let Some(expires_at) = token.expires_at() else {
            return RefreshSchedule::Never;
        };
        let remaining = expires_at - now;
        let lead = time::Duration::try_from(lead).unwrap_or(time::Duration::MAX);
        if remaining <= lead {
            return RefreshSchedule::Immediate;
        }
        match Duration::try_from(remaining - lead) {
            Ok(delay) => RefreshSchedule::After(delay),
            Err(_) => RefreshSchedule::Immediate,
        }
    }
}
