use std::collections::BTreeMap;

use reqwest::StatusCode;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{dto::validation, state::SessionError};

/// Result alias for REST calls issued by the outbound client.
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures raised by the outbound REST layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build HTTP client")]
    ClientBuilder {
        /// Underlying reqwest failure.
        #[source]
        source: reqwest::Error,
    },
    /// The request could not be sent (DNS, TLS, connection reset, ...).
    #[error("failed to send request to `{path}`")]
    Request {
        /// Endpoint path.
        path: String,
        /// Underlying transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// The response body did not match the expected payload.
    #[error("failed to decode response from `{path}`")]
    Decode {
        /// Endpoint path.
        path: String,
        /// Underlying decoding failure.
        #[source]
        source: reqwest::Error,
    },
    /// The backend kept answering 401 after the unauthorized retry budget.
    #[error("unauthorized request to `{path}`")]
    Unauthorized {
        /// Endpoint path.
        path: String,
    },
    /// The backend rejected the payload with structured field errors.
    #[error("validation rejected by `{path}`")]
    Validation {
        /// Endpoint path.
        path: String,
        /// Raw response body carrying the field errors.
        body: String,
    },
    /// Any other non-success status.
    #[error("unexpected status {status} from `{path}`")]
    Status {
        /// Endpoint path.
        path: String,
        /// Status the backend answered with.
        status: StatusCode,
        /// Raw response body.
        body: String,
    },
    /// The returned access token could not be installed in the session.
    #[error("failed to install session token")]
    Session(#[from] SessionError),
}

/// Errors surfaced to a form: either per field (inline) or as a single toast message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    /// Field name to the messages that should be shown next to it.
    #[error("invalid fields: {}", .0.keys().cloned().collect::<Vec<_>>().join(", "))]
    Fields(BTreeMap<String, Vec<String>>),
    /// Free-form failure shown as a notification.
    #[error("{0}")]
    Message(String),
}

impl From<ValidationErrors> for FormError {
    fn from(errors: ValidationErrors) -> Self {
        let fields = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages = errors
                    .iter()
                    .map(|error| {
                        error
                            .message
                            .as_ref()
                            .map(|message| message.to_string())
                            .unwrap_or_else(|| error.code.to_string())
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        FormError::Fields(fields)
    }
}

impl From<ApiError> for FormError {
    fn from(err: ApiError) -> Self {
        let body = match &err {
            ApiError::Validation { body, .. } | ApiError::Status { body, .. } => Some(body.as_str()),
            _ => None,
        };
        if let Some(body) = body {
            if let Some(fields) = validation::parse_backend_errors(body) {
                return FormError::Fields(fields);
            }
            if let Some(detail) = validation::detail_message(body) {
                return FormError::Message(detail);
            }
        }
        FormError::Message(err.to_string())
    }
}

/// Failure reported by an identity provider while minting an ID token.
#[derive(Debug, Clone, Error)]
#[error("identity provider failure: {0}")]
pub struct ProviderError(
    /// Provider-specific description.
    pub String,
);

/// Failures of a single reconciliation pass.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity provider could not mint a token.
    #[error("token acquisition failed")]
    Provider(#[source] ProviderError),
    /// The backend did not confirm the token.
    #[error("session verification failed")]
    Verification(#[source] ApiError),
    /// The minted token could not be decoded or stored.
    #[error("token could not be installed")]
    Install(#[source] SessionError),
}

/// Failures while preparing a checkout poll.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The payment provider redirect could not be parsed.
    #[error("invalid checkout redirect `{url}`: {reason}")]
    InvalidRedirect {
        /// Redirect as received.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Failures raised by a room transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Opening the socket failed.
    #[error("failed to open room socket: {0}")]
    Open(String),
    /// The socket was closed by the peer.
    #[error("room socket closed")]
    Closed,
    /// A frame could not be decoded.
    #[error("malformed room frame: {0}")]
    Protocol(String),
}

/// Failures surfaced to callers of the room connection lifecycle.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Operation requires a live connection.
    #[error("room connection is not established")]
    NotConnected,
    /// The first attempt failed and reconnection is disabled.
    #[error("failed to connect to room `{room_id}`")]
    Failed {
        /// Room that was being joined.
        room_id: String,
        /// Last transport failure.
        #[source]
        source: TransportError,
    },
    /// Every reconnection attempt failed.
    #[error("gave up on room `{room_id}` after {attempts} reconnection attempts")]
    ReconnectExhausted {
        /// Room that was being joined.
        room_id: String,
        /// Reconnection attempts made, not counting the initial one.
        attempts: u32,
    },
    /// `disconnect` was called while the connection was being established.
    #[error("connection to room `{room_id}` was cancelled")]
    Cancelled {
        /// Room that was being joined.
        room_id: String,
    },
}
