//! API client module for the brokerage market-data and trader endpoints

pub mod accounts;
pub mod client;
pub mod market_data;
pub mod orders;

use std::sync::Arc;

use anyhow::Result;

use crate::auth::commands::{build_session, Interaction};
use crate::auth::{Authenticator, StaticCredential};
use crate::config::Config;
use client::RequestExecutor;

/// Build an executor for `config`. A supplied access token bypasses the
/// session manager entirely.
pub fn executor(config: &Config, access_token: Option<&str>) -> Result<RequestExecutor> {
    let session: Arc<dyn Authenticator> = match access_token {
        Some(token) => {
            tracing::debug!("Using access token from the command line");
            Arc::new(StaticCredential::new(token))
        }
        None => Arc::new(build_session(config, Interaction::Browser)?),
    };
    Ok(RequestExecutor::new(config.api_base.clone(), session))
}
