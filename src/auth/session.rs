//! Session manager: the single owner of credential acquisition
//!
//! Every outbound call asks [`SessionManager::ensure_authenticated`] for a
//! credential. A fresh stored credential is handed out directly; anything
//! else goes through one shared acquisition (refresh, falling back to the
//! interactive authorizer) that all concurrent callers await together.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use super::flow::Authorizer;
use super::oauth::TokenEndpoint;
use super::tokens::{Clock, CredentialStore, FreshnessPolicy, StoredCredential, SystemClock};
use super::{AuthError, Authenticator, Credential};

type Acquisition = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireMode {
    /// Reuse a fresh credential, otherwise refresh or authorize
    Reuse,
    /// Refresh even if fresh, authorize if refresh is impossible
    ForceRefresh,
    /// Skip straight to the interactive authorizer
    Reauthorize,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    authorizer: Arc<dyn Authorizer>,
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
}

/// Hands out valid credentials, acquiring at most one at a time.
pub struct SessionManager {
    inner: Arc<Inner>,
    in_flight: Mutex<Option<Acquisition>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        authorizer: Arc<dyn Authorizer>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self::with_clock(store, endpoint, authorizer, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        authorizer: Arc<dyn Authorizer>,
        policy: FreshnessPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                endpoint,
                authorizer,
                policy,
                clock,
            }),
            in_flight: Mutex::new(None),
        }
    }

    /// Current stored credential, if any, without touching the network.
    pub fn stored(&self) -> Option<StoredCredential> {
        self.inner.store.load()
    }

    pub fn is_fresh(&self, stored: &StoredCredential) -> bool {
        self.inner.policy.is_fresh(stored, self.inner.clock.now())
    }

    /// Return a usable credential, refreshing or re-authorizing as needed.
    ///
    /// `force_refresh` skips the freshness check. Callers that arrive while
    /// an acquisition is outstanding share its outcome instead of starting
    /// their own.
    pub async fn ensure_authenticated(&self, force_refresh: bool) -> Result<Credential, AuthError> {
        let mode = if force_refresh {
            AcquireMode::ForceRefresh
        } else {
            AcquireMode::Reuse
        };
        self.gated(mode).await
    }

    /// Run the interactive authorizer even if a usable credential exists.
    pub async fn reauthorize(&self) -> Result<Credential, AuthError> {
        self.gated(AcquireMode::Reauthorize).await
    }

    async fn gated(&self, mode: AcquireMode) -> Result<Credential, AuthError> {
        let flight = {
            let mut slot = self.in_flight.lock().await;

            // A finished acquisition whose owner never cleared the slot must not be reused.
            if slot.as_ref().map_or(false, |f| f.peek().is_some()) {
                *slot = None;
            }

            match slot.as_ref() {
                Some(flight) => {
                    tracing::debug!("Joining in-flight credential acquisition");
                    flight.clone()
                }
                None => {
                    if mode == AcquireMode::Reuse {
                        if let Some(stored) = self.inner.store.load() {
                            if self.is_fresh(&stored) {
                                return Ok(stored.credential);
                            }
                        }
                    }
                    let flight = Inner::acquire(Arc::clone(&self.inner), mode)
                        .boxed()
                        .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().map_or(false, |f| f.ptr_eq(&flight)) {
            *slot = None;
        }
        result
    }
}

#[async_trait]
impl Authenticator for SessionManager {
    async fn ensure_authenticated(&self, force_refresh: bool) -> Result<Credential, AuthError> {
        SessionManager::ensure_authenticated(self, force_refresh).await
    }
}

impl Inner {
    async fn acquire(self: Arc<Self>, mode: AcquireMode) -> Result<Credential, AuthError> {
        let stored = self.store.load();

        // Another process may have refreshed since the caller looked.
        if let Some(stored) = stored.as_ref() {
            if mode == AcquireMode::Reuse && self.policy.is_fresh(stored, self.clock.now()) {
                return Ok(stored.credential.clone());
            }
        }

        let previous_refresh = match mode {
            AcquireMode::Reauthorize => None,
            _ => stored
                .as_ref()
                .and_then(|s| s.credential.refresh_token.clone()),
        };

        let refresh_failure = match previous_refresh.as_deref() {
            Some(refresh_token) => match self.endpoint.refresh(refresh_token).await {
                Ok(credential) => {
                    let credential = credential.inherit_refresh_token(Some(refresh_token));
                    self.persist(credential.clone(), stored.as_ref())?;
                    tracing::info!("Access token refreshed");
                    return Ok(credential);
                }
                Err(e) => {
                    tracing::warn!("Refresh failed, falling back to interactive authorization: {}", e);
                    Some(e)
                }
            },
            None if mode == AcquireMode::Reauthorize => {
                tracing::info!("Re-authorizing interactively");
                None
            }
            None => {
                if stored.is_some() {
                    tracing::info!("Stored credential has no refresh token, authorizing interactively");
                } else {
                    tracing::info!("No stored credential, authorizing interactively");
                }
                None
            }
        };

        match self.authorizer.authorize().await {
            Ok(credential) => {
                self.persist(credential.clone(), stored.as_ref())?;
                tracing::info!("Authorization complete");
                Ok(credential)
            }
            Err(e) if e.is_flow_infrastructure() => Err(e),
            Err(e) => Err(AuthError::Authentication(match refresh_failure {
                Some(refresh_err) => format!(
                    "refresh failed ({}); interactive authorization failed ({})",
                    refresh_err, e
                ),
                None => format!("interactive authorization failed ({})", e),
            })),
        }
    }

    /// Write the new credential before anyone sees it.
    fn persist(
        &self,
        credential: Credential,
        previous: Option<&StoredCredential>,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        let acquired_at = previous.map_or(now, |p| now.max(p.acquired_at));
        self.store
            .save(&StoredCredential::new(credential, acquired_at))
            .map_err(|e| AuthError::Storage(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::{ManualClock, MemoryCredentialStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000;

    /// Token endpoint that counts refreshes and hands out numbered tokens.
    struct CountingEndpoint {
        refreshes: AtomicUsize,
        fail: bool,
        rotate_refresh_token: bool,
    }

    impl CountingEndpoint {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                fail: false,
                rotate_refresh_token: true,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                fail: true,
                rotate_refresh_token: true,
            })
        }

        fn count(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<Credential, AuthError> {
            unreachable!("session manager exchanges grants only through the authorizer")
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AuthError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(AuthError::GrantExchange("invalid_grant".into()));
            }
            Ok(Credential {
                refresh_token: self
                    .rotate_refresh_token
                    .then(|| format!("refresh-{}", n)),
                expires_in: Some(1800),
                ..Credential::bearer(format!("refreshed-{}", n))
            })
        }
    }

    struct CountingAuthorizer {
        calls: AtomicUsize,
        result: Result<Credential, AuthError>,
    }

    impl CountingAuthorizer {
        fn ok(token: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Ok(Credential {
                    refresh_token: Some("rt-interactive".into()),
                    expires_in: Some(1800),
                    ..Credential::bearer(token)
                }),
            })
        }

        fn failing(err: AuthError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Err(err),
            })
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authorizer for CountingAuthorizer {
        async fn authorize(&self) -> Result<Credential, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.result.clone()
        }
    }

    struct Harness {
        store: Arc<MemoryCredentialStore>,
        endpoint: Arc<CountingEndpoint>,
        authorizer: Arc<CountingAuthorizer>,
        clock: Arc<ManualClock>,
        session: Arc<SessionManager>,
    }

    fn harness(
        initial: Option<StoredCredential>,
        endpoint: Arc<CountingEndpoint>,
        authorizer: Arc<CountingAuthorizer>,
    ) -> Harness {
        let store = Arc::new(MemoryCredentialStore::new(initial));
        let clock = Arc::new(ManualClock::new(T0));
        let session = Arc::new(SessionManager::with_clock(
            store.clone(),
            endpoint.clone(),
            authorizer.clone(),
            FreshnessPolicy::default(),
            clock.clone(),
        ));
        Harness {
            store,
            endpoint,
            authorizer,
            clock,
            session,
        }
    }

    fn stored(token: &str, refresh: Option<&str>, expires_in: Option<u64>, at: i64) -> StoredCredential {
        StoredCredential::new(
            Credential {
                refresh_token: refresh.map(str::to_string),
                expires_in,
                ..Credential::bearer(token)
            },
            at,
        )
    }

    #[tokio::test]
    async fn test_no_stored_credential_runs_interactive_flow() {
        let h = harness(None, CountingEndpoint::ok(), CountingAuthorizer::ok("fresh"));
        let cred = h.session.ensure_authenticated(false).await.unwrap();

        assert_eq!(cred.access_token, "fresh");
        assert_eq!(h.authorizer.count(), 1);
        assert_eq!(h.endpoint.count(), 0);
        let saved = h.store.load().unwrap();
        assert_eq!(saved.credential.access_token, "fresh");
        assert_eq!(saved.acquired_at, T0);
    }

    #[tokio::test]
    async fn test_fresh_credential_returned_until_safety_margin() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("unused"),
        );

        h.clock.set(T0 + 1800 - 301);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "abc");
        assert_eq!(h.endpoint.count(), 0);

        h.clock.set(T0 + 1800 - 299);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "refreshed-1");
        assert_eq!(h.endpoint.count(), 1);
        assert_eq!(h.authorizer.count(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_freshness() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("unused"),
        );
        h.clock.set(T0 + 10);

        let cred = h.session.ensure_authenticated(true).await.unwrap();
        assert_eq!(cred.access_token, "refreshed-1");
        assert_eq!(h.endpoint.count(), 1);
        let saved = h.store.load().unwrap();
        assert_eq!(saved.credential.access_token, "refreshed-1");
        assert_eq!(saved.acquired_at, T0 + 10);
    }

    #[tokio::test]
    async fn test_force_refresh_without_refresh_token_authorizes() {
        let h = harness(
            Some(stored("abc", None, Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("interactive"),
        );
        let cred = h.session.ensure_authenticated(true).await.unwrap();
        assert_eq!(cred.access_token, "interactive");
        assert_eq!(h.endpoint.count(), 0);
        assert_eq!(h.authorizer.count(), 1);
    }

    #[tokio::test]
    async fn test_stale_without_refresh_token_authorizes() {
        let h = harness(
            Some(stored("abc", None, None, T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("interactive"),
        );
        h.clock.set(T0 + 1500);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "interactive");
        assert_eq!(h.authorizer.count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_interactive() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::failing(),
            CountingAuthorizer::ok("interactive"),
        );
        h.clock.set(T0 + 2000);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "interactive");
        assert_eq!(h.endpoint.count(), 1);
        assert_eq!(h.authorizer.count(), 1);
        assert_eq!(h.store.load().unwrap().credential.access_token, "interactive");
    }

    #[tokio::test]
    async fn test_refresh_and_interactive_failure_is_authentication_error() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::failing(),
            CountingAuthorizer::failing(AuthError::GrantExchange("access_denied".into())),
        );
        h.clock.set(T0 + 2000);
        let err = h.session.ensure_authenticated(false).await.unwrap_err();
        match err {
            AuthError::Authentication(msg) => {
                assert!(msg.contains("invalid_grant"));
                assert!(msg.contains("access_denied"));
            }
            other => panic!("Expected Authentication, got {:?}", other),
        }
        // Stale credential stays in place
        assert_eq!(h.store.load().unwrap().credential.access_token, "abc");
    }

    #[tokio::test]
    async fn test_timeout_propagates_unwrapped() {
        let h = harness(
            None,
            CountingEndpoint::ok(),
            CountingAuthorizer::failing(AuthError::Timeout {
                detail: "no authorization callback within 300s".into(),
                authorization_url: "https://auth/x".into(),
            }),
        );
        let err = h.session.ensure_authenticated(false).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout { .. }));
        assert_eq!(err.authorization_url(), Some("https://auth/x"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_interactive_flow() {
        let h = harness(None, CountingEndpoint::ok(), CountingAuthorizer::ok("shared"));

        let calls = (0..16).map(|_| {
            let session = Arc::clone(&h.session);
            async move { session.ensure_authenticated(false).await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(h.authorizer.count(), 1);
        for r in results {
            assert_eq!(r.unwrap().access_token, "shared");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_collapse_across_threads() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("unused"),
        );
        h.clock.set(T0 + 1600);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = Arc::clone(&h.session);
                tokio::spawn(async move { session.ensure_authenticated(false).await })
            })
            .collect();

        for handle in handles {
            let cred = handle.await.unwrap().unwrap();
            assert_eq!(cred.access_token, "refreshed-1");
        }
        assert_eq!(h.endpoint.count(), 1);
        assert_eq!(h.authorizer.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let h = harness(
            None,
            CountingEndpoint::ok(),
            CountingAuthorizer::failing(AuthError::GrantExchange("access_denied".into())),
        );

        let calls = (0..8).map(|_| {
            let session = Arc::clone(&h.session);
            async move { session.ensure_authenticated(false).await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(h.authorizer.count(), 1);
        let first = results[0].clone().unwrap_err();
        for r in results {
            assert_eq!(r.unwrap_err(), first);
        }
    }

    #[tokio::test]
    async fn test_failed_acquisition_is_not_cached() {
        let h = harness(
            None,
            CountingEndpoint::ok(),
            CountingAuthorizer::failing(AuthError::GrantExchange("access_denied".into())),
        );
        tokio_test::assert_err!(h.session.ensure_authenticated(false).await);
        tokio_test::assert_err!(h.session.ensure_authenticated(false).await);
        assert_eq!(h.authorizer.count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_refresh_token_when_not_rotated() {
        let endpoint = Arc::new(CountingEndpoint {
            refreshes: AtomicUsize::new(0),
            fail: false,
            rotate_refresh_token: false,
        });
        let h = harness(
            Some(stored("abc", Some("long-lived"), Some(1800), T0)),
            endpoint,
            CountingAuthorizer::ok("unused"),
        );
        h.clock.set(T0 + 1700);
        h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(
            h.store.load().unwrap().credential.refresh_token.as_deref(),
            Some("long-lived")
        );
    }

    #[tokio::test]
    async fn test_acquisition_timestamp_never_moves_backwards() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0 + 500)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("unused"),
        );
        // Wall clock stepped back behind the stored record
        h.clock.set(T0);
        h.session.ensure_authenticated(true).await.unwrap();
        assert_eq!(h.store.load().unwrap().acquired_at, T0 + 500);
    }

    #[tokio::test]
    async fn test_refresh_scenario_then_reuse() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("unused"),
        );

        h.clock.set(T0 + 1600);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "refreshed-1");

        h.clock.set(T0 + 1650);
        let cred = h.session.ensure_authenticated(false).await.unwrap();
        assert_eq!(cred.access_token, "refreshed-1");
        assert_eq!(h.endpoint.count(), 1);
    }

    #[tokio::test]
    async fn test_reauthorize_skips_refresh() {
        let h = harness(
            Some(stored("abc", Some("rt"), Some(1800), T0)),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("interactive"),
        );
        let cred = h.session.reauthorize().await.unwrap();
        assert_eq!(cred.access_token, "interactive");
        assert_eq!(h.endpoint.count(), 0);
        assert_eq!(h.authorizer.count(), 1);
        assert_eq!(
            h.store.load().unwrap().credential.refresh_token.as_deref(),
            Some("rt-interactive")
        );
    }

    struct FailingStore;

    impl CredentialStore for FailingStore {
        fn load(&self) -> Option<StoredCredential> {
            None
        }
        fn save(&self, _stored: &StoredCredential) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unpersisted_credential_is_not_returned() {
        let session = SessionManager::new(
            Arc::new(FailingStore),
            CountingEndpoint::ok(),
            CountingAuthorizer::ok("fresh"),
            FreshnessPolicy::default(),
        );
        match session.ensure_authenticated(false).await {
            Err(AuthError::Storage(msg)) => assert!(msg.contains("disk full")),
            other => panic!("Expected Storage error, got {:?}", other),
        }
    }
}
