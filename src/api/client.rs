//! Authenticated HTTP client for the brokerage API
//!
//! Wraps reqwest::Client with bearer-token injection and a single
//! forced-refresh retry when a request is rejected as unauthorized.

use std::future::Future;
use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::auth::{AuthError, Authenticator, Credential};

/// Failure of one API call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server rejected the credential (HTTP 401)
    #[error("401 Unauthorized for {url}: {body}")]
    Unauthorized { url: String, body: String },

    #[error("rate limited (HTTP 429) for {url}")]
    RateLimited {
        url: String,
        retry_after: Option<String>,
    },

    #[error("HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Successful response, fully buffered.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub url: String,
    /// `Location` header, used by order placement
    pub location: Option<String>,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|source| ApiError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

/// Runs authenticated requests, retrying once after a forced refresh on 401.
#[derive(Clone)]
pub struct RequestExecutor {
    http: reqwest::Client,
    base_url: String,
    session: Arc<dyn Authenticator>,
}

impl RequestExecutor {
    pub fn new(base_url: impl Into<String>, session: Arc<dyn Authenticator>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run `call` with a valid credential. If it fails with
    /// [`ApiError::Unauthorized`], force a refresh and run it exactly once
    /// more; any other outcome is returned untouched.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let credential = self.session.ensure_authenticated(false).await?;
        match call(credential).await {
            Err(ApiError::Unauthorized { url, .. }) => {
                tracing::info!("Credential rejected for {}, forcing refresh and retrying", url);
                let credential = self.session.ensure_authenticated(true).await?;
                call(credential).await
            }
            other => other,
        }
    }

    /// Send one request with retry. `body` is sent as JSON.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<RawResponse, ApiError> {
        let url = self.url(path);
        self.execute_with_retry(|credential| {
            let method = method.clone();
            let url = url.clone();
            async move {
                tracing::debug!("{} {}", method, url);
                let mut req = self
                    .http
                    .request(method.clone(), &url)
                    .bearer_auth(&credential.access_token)
                    .header("Accept", "application/json")
                    .query(query);
                if let Some(body) = body {
                    req = req.json(body);
                }
                let resp = req.send().await.map_err(|source| ApiError::Transport {
                    url: url.clone(),
                    source,
                })?;
                check_response(resp, &url).await
            }
        })
        .await
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send(Method::GET, path, query, None).await?.json()
    }
}

/// Map the response status to a typed error, buffering the body.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<RawResponse, ApiError> {
    let status = resp.status();
    let location = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = resp.text().await.map_err(|source| ApiError::Transport {
        url: url.to_string(),
        source,
    })?;

    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized {
            url: url.to_string(),
            body,
        });
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited {
            url: url.to_string(),
            retry_after,
        });
    }
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }

    Ok(RawResponse {
        status: status.as_u16(),
        url: url.to_string(),
        location,
        body,
    })
}
