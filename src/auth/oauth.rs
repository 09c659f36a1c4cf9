//! OAuth2 authorization-code and refresh grants against the brokerage token endpoint

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, TokenResponse, TokenUrl,
};
use url::Url;

use super::{AuthConfig, AuthError, Credential};

/// The brokerage's token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange a one-time authorization grant for a credential.
    async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError>;
    /// Obtain a new credential from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError>;
}

/// Token endpoint backed by the `oauth2` crate.
///
/// Client credentials travel in a Basic auth header (the `oauth2` default).
pub struct OAuthTokenEndpoint {
    client: BasicClient,
}

impl OAuthTokenEndpoint {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let auth_url = AuthUrl::new(config.authorize_url.clone())
            .map_err(|e| AuthError::Configuration(format!("authorize_url: {}", e)))?;
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| AuthError::Configuration(format!("token_url: {}", e)))?;
        let redirect_url = RedirectUrl::new(config.redirect_uri.clone())
            .map_err(|e| AuthError::Configuration(format!("redirect_uri: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect_url);

        Ok(Self { client })
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError> {
        tracing::info!("Exchanging authorization grant for a credential...");
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| map_token_error("authorization code exchange", e))?;
        Ok(credential_from_response(&response))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        tracing::info!("Refreshing access token...");
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| map_token_error("token refresh", e))?;
        Ok(credential_from_response(&response))
    }
}

fn credential_from_response(response: &BasicTokenResponse) -> Credential {
    Credential {
        access_token: response.access_token().secret().to_string(),
        refresh_token: response.refresh_token().map(|rt| rt.secret().to_string()),
        token_type: AsRef::<str>::as_ref(response.token_type()).to_string(),
        expires_in: response.expires_in().map(|d| d.as_secs()),
        scope: response.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
    }
}

fn map_token_error(
    what: &str,
    err: RequestTokenError<oauth2::reqwest::Error<reqwest::Error>, BasicErrorResponse>,
) -> AuthError {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            AuthError::GrantExchange(format!("{} rejected: {}", what, resp))
        }
        RequestTokenError::Request(e) => AuthError::Network(format!("{}: {}", what, e)),
        RequestTokenError::Parse(e, _body) => {
            AuthError::GrantExchange(format!("{}: unparseable token response: {}", what, e))
        }
        RequestTokenError::Other(msg) => AuthError::GrantExchange(format!("{}: {}", what, msg)),
    }
}

/// Browser-facing authorization request with its CSRF state.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

impl AuthorizationRequest {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        Self::with_state(config, CsrfToken::new_random().secret().to_string())
    }

    pub fn with_state(config: &AuthConfig, state: String) -> Result<Self, AuthError> {
        let mut url = Url::parse(&config.authorize_url)
            .map_err(|e| AuthError::Configuration(format!("authorize_url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &config.client_id)
                .append_pair("redirect_uri", &config.redirect_uri)
                .append_pair("state", &state);
            if let Some(scope) = config.scope.as_deref() {
                query.append_pair("scope", scope);
            }
        }
        Ok(Self {
            url: url.into(),
            state,
        })
    }
}
