//! Authentication error taxonomy

use thiserror::Error;

/// Failure to produce a valid credential.
///
/// Cloneable so a single failed acquisition can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Connection or timeout talking to the brokerage token endpoint.
    #[error("network error talking to token endpoint: {0}")]
    Network(String),

    /// Refresh and interactive authorization were both exhausted.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The local callback listener could not bind or be reached.
    #[error("callback listener failed to start: {detail}")]
    ListenerStartup {
        detail: String,
        authorization_url: String,
    },

    /// The listener did not become ready, or no callback arrived, in time.
    #[error("timed out: {detail}")]
    Timeout {
        detail: String,
        authorization_url: String,
    },

    /// Callback received but the grant was missing, rejected or unusable.
    #[error("authorization grant exchange failed: {0}")]
    GrantExchange(String),

    /// The certificate provider could not build a TLS context.
    #[error("TLS certificate unavailable: {0}")]
    Certificate(String),

    /// A new credential could not be persisted.
    #[error("failed to persist credential: {0}")]
    Storage(String),

    #[error("invalid auth configuration: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Authorization URL for completing the flow by hand, when the
    /// automated listener could not be used.
    pub fn authorization_url(&self) -> Option<&str> {
        match self {
            AuthError::ListenerStartup {
                authorization_url, ..
            }
            | AuthError::Timeout {
                authorization_url, ..
            } => Some(authorization_url),
            _ => None,
        }
    }

    /// Whether this error is terminal for the session manager without
    /// further wrapping (deadline and listener failures carry their own
    /// actionable detail).
    pub(crate) fn is_flow_infrastructure(&self) -> bool {
        matches!(
            self,
            AuthError::Timeout { .. } | AuthError::ListenerStartup { .. }
        )
    }
}
