//! login / logout / status commands

use std::sync::Arc;

use anyhow::{Context, Result};

use super::browser::{BrowserLauncher, NoBrowser, SystemBrowser};
use super::tls::{CertificateProvider, PemCertificateProvider};
use super::{
    AuthError, Authorizer, CredentialStore, FileCredentialStore, LoopbackFlow, ManualFlow,
    OAuthTokenEndpoint, SessionManager, TokenEndpoint,
};
use crate::config::Config;

/// How the user completes authorization when one is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interaction {
    /// Local listener, opening the default browser
    #[default]
    Browser,
    /// Local listener, URL printed only
    NoBrowser,
    /// Paste the redirected URL back into the terminal
    Manual,
}

/// Assemble the session manager described by `config`.
pub fn build_session(config: &Config, interaction: Interaction) -> Result<SessionManager> {
    config.validate()?;
    let auth_config = config.auth_config();

    let endpoint: Arc<dyn TokenEndpoint> = Arc::new(OAuthTokenEndpoint::new(&auth_config)?);
    let authorizer: Arc<dyn Authorizer> = match interaction {
        Interaction::Manual => Arc::new(
            ManualFlow::new(auth_config, endpoint.clone())
                .with_timeout(config.flow_timeouts().callback),
        ),
        Interaction::Browser | Interaction::NoBrowser => {
            let certificates: Option<Arc<dyn CertificateProvider>> =
                match (&config.tls_cert_path, &config.tls_key_path) {
                    (Some(cert), Some(key)) => {
                        Some(Arc::new(PemCertificateProvider::new(cert, key)))
                    }
                    _ => None,
                };
            let browser: Arc<dyn BrowserLauncher> = if interaction == Interaction::NoBrowser {
                Arc::new(NoBrowser)
            } else {
                Arc::new(SystemBrowser)
            };
            Arc::new(
                LoopbackFlow::new(auth_config, endpoint.clone(), certificates, browser)?
                    .with_timeouts(config.flow_timeouts()),
            )
        }
    };

    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config.credential_path()?));
    Ok(SessionManager::new(
        store,
        endpoint,
        authorizer,
        config.freshness_policy(),
    ))
}

/// Obtain a credential, interactively if needed
pub async fn login(config: &Config, force: bool, interaction: Interaction) -> Result<()> {
    let session = build_session(config, interaction)?;

    if !force {
        if let Some(stored) = session.stored() {
            if session.is_fresh(&stored) {
                println!("Already logged in (access token valid). Use --force to re-authenticate.");
                return Ok(());
            }
        }
    }

    let result = if force {
        session.reauthorize().await
    } else {
        session.ensure_authenticated(false).await
    };

    result.context("Login failed")?;
    println!("Login successful.");
    Ok(())
}

/// Tell the user how to finish by hand when the listener could not be used.
pub fn print_manual_fallback(err: &AuthError) {
    if let Some(url) = err.authorization_url() {
        eprintln!();
        eprintln!("Automatic authorization did not complete. To finish manually, visit:");
        eprintln!("  {}", url);
        eprintln!("or run 'trader-cli login --manual'.");
    }
}

/// Clear stored credentials
pub async fn logout(config: &Config) -> Result<()> {
    let store = FileCredentialStore::new(config.credential_path()?);
    store.clear()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status without touching the network
pub async fn status(config: &Config) -> Result<()> {
    let path = config.credential_path()?;
    let store = FileCredentialStore::new(&path);
    let policy = config.freshness_policy();
    let now = chrono::Utc::now().timestamp();

    println!("Credential file: {}", path.display());

    let Some(stored) = store.load() else {
        println!("Access token: none");
        println!("\nRun 'trader-cli login' to authenticate.");
        return Ok(());
    };

    if policy.is_fresh(&stored, now) {
        println!("Access token: valid");
    } else {
        println!("Access token: stale");
    }
    println!("  acquired:   {}", format_epoch(stored.acquired_at));
    match stored.expires_at() {
        Some(exp) => {
            println!("  expires:    {}", format_epoch(exp));
            let remaining = exp - now;
            if remaining > 0 {
                println!("  remaining:  {}m {}s", remaining / 60, remaining % 60);
            }
        }
        None => println!("  expires:    unknown"),
    }
    if let Some(scope) = stored.credential.scope.as_deref() {
        println!("  scope:      {}", scope);
    }

    match stored.credential.refresh_token {
        Some(_) => println!("Refresh tok:  present"),
        None => println!("Refresh tok:  none"),
    }

    Ok(())
}

fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}
