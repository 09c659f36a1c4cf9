//! Credential storage and freshness

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
#[cfg(test)]
use std::sync::Mutex;

/// Seconds before expiry at which a credential stops being reused.
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 300;
/// Reuse window for credentials issued without an `expires_in`.
pub const DEFAULT_FALLBACK_WINDOW_SECS: u64 = 1500;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Bearer credential as issued by the token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Credential {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_in: None,
            scope: None,
        }
    }

    /// Credential from a refresh response, keeping `previous` refresh token
    /// when the endpoint did not rotate it.
    pub fn inherit_refresh_token(self, previous: Option<&str>) -> Self {
        if self.refresh_token.is_some() {
            return self;
        }
        Self {
            refresh_token: previous.map(str::to_string),
            ..self
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Persisted credential plus the time it was obtained.
///
/// Serialized as one flat JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(flatten)]
    pub credential: Credential,
    /// Epoch seconds
    pub acquired_at: i64,
}

impl StoredCredential {
    pub fn new(credential: Credential, acquired_at: i64) -> Self {
        Self {
            credential,
            acquired_at,
        }
    }

    /// Epoch seconds at which the token itself expires, if known.
    pub fn expires_at(&self) -> Option<i64> {
        self.credential
            .expires_in
            .map(|e| self.acquired_at.saturating_add(e as i64))
    }
}

/// Decides whether a stored credential may be reused without a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub safety_margin_secs: u64,
    pub fallback_window_secs: u64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            fallback_window_secs: DEFAULT_FALLBACK_WINDOW_SECS,
        }
    }
}

impl FreshnessPolicy {
    pub fn is_fresh(&self, stored: &StoredCredential, now: i64) -> bool {
        match stored.credential.expires_in {
            Some(expires_in) => {
                let cutoff = stored
                    .acquired_at
                    .saturating_add(expires_in as i64)
                    .saturating_sub(self.safety_margin_secs as i64);
                now < cutoff
            }
            None => now.saturating_sub(stored.acquired_at) < self.fallback_window_secs as i64,
        }
    }
}

/// Source of the current time in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persistence for the single session credential.
///
/// `load` never fails: unreadable or unrecognized records count as absent.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<StoredCredential>;
    fn save(&self, stored: &StoredCredential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file store, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<StoredCredential> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Ignoring unreadable credential file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<StoredCredential>(&content) {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::warn!(
                    "Discarding unrecognized credential record {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    fn save(&self, stored: &StoredCredential) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).context("Failed to create credential directory")?;

        let content =
            serde_json::to_vec_pretty(stored).context("Failed to serialize credential")?;

        // Same-directory temp file so the rename stays on one filesystem.
        // tempfile creates it 0600 on unix.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("Failed to create temporary credential file")?;
        tmp.write_all(&content)
            .context("Failed to write credential file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush credential file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .context("Failed to replace credential file")?;

        tracing::debug!("Credential saved to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove credential file"),
        }
    }
}

/// Process-local store.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<StoredCredential>>,
}

#[cfg(test)]
impl MemoryCredentialStore {
    pub fn new(initial: Option<StoredCredential>) -> Self {
        Self {
            slot: Mutex::new(initial),
        }
    }
}

#[cfg(test)]
impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<StoredCredential> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn save(&self, stored: &StoredCredential) -> Result<()> {
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stored.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}
