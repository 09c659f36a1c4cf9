//! Authentication module for the brokerage API
//!
//! Implements the OAuth2 authorization-code flow with a local HTTPS
//! redirect listener, and a session manager that keeps a valid bearer
//! credential on hand for every request.

pub mod browser;
pub mod callback;
pub mod commands;
pub mod error;
pub mod flow;
pub mod oauth;
pub mod session;
pub mod tls;
pub mod tokens;

use async_trait::async_trait;

pub use commands::{login, logout, status};
pub use error::AuthError;
pub use flow::{Authorizer, FlowTimeouts, LoopbackFlow, ManualFlow};
pub use oauth::{OAuthTokenEndpoint, TokenEndpoint};
pub use session::SessionManager;
pub use tokens::{
    Credential, CredentialStore, FileCredentialStore, FreshnessPolicy, StoredCredential,
};

/// OAuth client configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth2 client ID (app key)
    pub client_id: String,
    pub client_secret: String,
    /// Registered redirect URI; also where the local listener binds
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scope: Option<String>,
}

/// Anything that can hand out a bearer credential for a request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A credential valid for the next call. `force_refresh` asks for a
    /// new one even if the current one still looks fresh.
    async fn ensure_authenticated(&self, force_refresh: bool) -> Result<Credential, AuthError>;
}

/// Fixed access token supplied by the caller. It cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            credential: Credential::bearer(access_token),
        }
    }
}

#[async_trait]
impl Authenticator for StaticCredential {
    async fn ensure_authenticated(&self, force_refresh: bool) -> Result<Credential, AuthError> {
        if force_refresh {
            return Err(AuthError::Authentication(
                "supplied access token was rejected and cannot be refreshed".into(),
            ));
        }
        Ok(self.credential.clone())
    }
}
