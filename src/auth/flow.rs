//! Interactive authorization: browser consent captured on a local listener,
//! or pasted back by hand.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use url::Url;

use super::browser::BrowserLauncher;
use super::callback::{CallbackPayload, CallbackServer, RedirectTarget};
use super::oauth::{AuthorizationRequest, TokenEndpoint};
use super::tls::CertificateProvider;
use super::{AuthConfig, AuthError, Credential};

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LISTENER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PASTED_BYTES: usize = 16 * 1024;

/// Obtains a brand-new credential with user involvement.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self) -> Result<Credential, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimeouts {
    /// Bind plus readiness probe
    pub listener_startup: Duration,
    /// Browser launch until callback
    pub callback: Duration,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            listener_startup: DEFAULT_LISTENER_STARTUP_TIMEOUT,
            callback: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    ListenerStarting,
    ListenerReady,
    AwaitingCallback,
    Completed,
    Failed,
    TimedOut,
}

struct StateTracker(FlowState);

impl StateTracker {
    fn advance(&mut self, next: FlowState) {
        tracing::debug!("Authorization flow: {:?} -> {:?}", self.0, next);
        self.0 = next;
    }

    /// Record the terminal state matching `result`.
    fn finish<T>(&mut self, result: &Result<T, AuthError>) {
        let terminal = match result {
            Ok(_) => FlowState::Completed,
            Err(AuthError::Timeout { .. }) => FlowState::TimedOut,
            Err(_) => FlowState::Failed,
        };
        self.advance(terminal);
    }
}

/// Browser consent with the redirect captured on a local listener.
pub struct LoopbackFlow {
    config: AuthConfig,
    target: RedirectTarget,
    endpoint: Arc<dyn TokenEndpoint>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    browser: Arc<dyn BrowserLauncher>,
    timeouts: FlowTimeouts,
}

impl LoopbackFlow {
    pub fn new(
        config: AuthConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        certificates: Option<Arc<dyn CertificateProvider>>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, AuthError> {
        let target = RedirectTarget::parse(&config.redirect_uri)?;
        Ok(Self {
            config,
            target,
            endpoint,
            certificates,
            browser,
            timeouts: FlowTimeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: FlowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Run one authorization attempt. The listener is released before this returns.
    pub async fn run(&self) -> Result<Credential, AuthError> {
        let mut state = StateTracker(FlowState::Idle);
        let request = AuthorizationRequest::new(&self.config)?;
        let result = self.run_with(&request, &mut state).await;
        state.finish(&result);
        result
    }

    async fn run_with(
        &self,
        request: &AuthorizationRequest,
        state: &mut StateTracker,
    ) -> Result<Credential, AuthError> {
        let acceptor = if self.target.is_secure() {
            let provider = self.certificates.as_ref().ok_or_else(|| {
                AuthError::Certificate(
                    "redirect_uri is https but no TLS certificate is configured".into(),
                )
            })?;
            Some(provider.server_context(&self.target.host)?)
        } else {
            None
        };

        state.advance(FlowState::ListenerStarting);
        let (done_tx, done_rx) = oneshot::channel();
        let server = tokio::time::timeout(
            self.timeouts.listener_startup,
            CallbackServer::start(
                &self.target,
                acceptor,
                request.state.clone(),
                &request.url,
                done_tx,
            ),
        )
        .await
        .map_err(|_| AuthError::Timeout {
            detail: format!(
                "callback listener on {}:{} not ready within {}s",
                self.target.host,
                self.target.port,
                self.timeouts.listener_startup.as_secs()
            ),
            authorization_url: request.url.clone(),
        })??;
        state.advance(FlowState::ListenerReady);

        self.launch_browser(&request.url);
        state.advance(FlowState::AwaitingCallback);

        let outcome = tokio::time::timeout(self.timeouts.callback, done_rx).await;
        server.shutdown().await;

        let code = match outcome {
            Ok(Ok(grant)) => grant?,
            Ok(Err(_)) => {
                return Err(AuthError::Authentication(
                    "callback listener stopped before a callback arrived".into(),
                ))
            }
            Err(_) => {
                return Err(AuthError::Timeout {
                    detail: format!(
                        "no authorization callback within {}s",
                        self.timeouts.callback.as_secs()
                    ),
                    authorization_url: request.url.clone(),
                })
            }
        };
        tracing::debug!("Received authorization grant ({} chars)", code.len());

        self.endpoint.exchange_code(&code).await
    }

    fn launch_browser(&self, url: &str) {
        println!();
        println!("To authorize, visit: {}", url);
        println!();
        match self.browser.open(url) {
            Ok(()) => tracing::info!("Opened browser for authorization"),
            Err(e) => tracing::warn!("Could not open browser ({}); open the URL above manually", e),
        }
    }
}

#[async_trait]
impl Authorizer for LoopbackFlow {
    async fn authorize(&self) -> Result<Credential, AuthError> {
        self.run().await
    }
}

/// Copy-paste authorization: the user visits the URL and pastes the final
/// redirected address back. Works when no local listener can be used.
pub struct ManualFlow {
    config: AuthConfig,
    endpoint: Arc<dyn TokenEndpoint>,
    timeout: Duration,
}

impl ManualFlow {
    pub fn new(config: AuthConfig, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            config,
            endpoint,
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Complete the flow from any line-oriented reader (stdin in practice).
    pub async fn run_with_reader<R>(&self, mut reader: R) -> Result<Credential, AuthError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut state = StateTracker(FlowState::Idle);
        let request = AuthorizationRequest::new(&self.config)?;

        println!();
        println!("Open this URL in a browser and authorize:");
        println!("  {}", request.url);
        println!();
        println!("Then paste the full address you were redirected to:");
        let _ = std::io::stdout().flush();
        state.advance(FlowState::AwaitingCallback);

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, reader.read_line(&mut line)).await;
        let result = match read {
            Err(_) => Err(AuthError::Timeout {
                detail: format!("no redirect URL pasted within {}s", self.timeout.as_secs()),
                authorization_url: request.url.clone(),
            }),
            Ok(Err(e)) => Err(AuthError::Authentication(format!(
                "could not read redirect URL: {}",
                e
            ))),
            Ok(Ok(_)) => match self.grant_from_redirect(line.trim(), &request.state) {
                Ok(code) => self.endpoint.exchange_code(&code).await,
                Err(e) => Err(e),
            },
        };
        state.finish(&result);
        result
    }

    fn grant_from_redirect(&self, pasted: &str, expected_state: &str) -> Result<String, AuthError> {
        let url = Url::parse(pasted)
            .map_err(|e| AuthError::GrantExchange(format!("not a valid URL: {}", e)))?;
        let expected = RedirectTarget::parse(&self.config.redirect_uri)?;
        if url.path() != expected.path {
            tracing::warn!(
                "Pasted URL path {} differs from redirect path {}",
                url.path(),
                expected.path
            );
        }
        CallbackPayload::from_url(&url).into_grant(expected_state)
    }
}

#[async_trait]
impl Authorizer for ManualFlow {
    async fn authorize(&self) -> Result<Credential, AuthError> {
        self.run_with_reader(BufReader::new(stdin_lines())).await
    }
}

/// Terminal input on a detached thread, so an abandoned read never holds
/// up runtime shutdown.
fn stdin_lines() -> DuplexStream {
    let (mut writer, reader) = tokio::io::duplex(MAX_PASTED_BYTES);
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            let _ = futures::executor::block_on(writer.write_all(line.as_bytes()));
        }
    });
    reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FakeEndpoint {
        exchanges: AtomicUsize,
        fail: bool,
    }

    impl FakeEndpoint {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                exchanges: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::GrantExchange("invalid_grant".into()));
            }
            Ok(Credential {
                refresh_token: Some("rt".into()),
                expires_in: Some(1800),
                ..Credential::bearer(format!("token-for-{}", code))
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AuthError> {
            unreachable!("interactive flow never refreshes")
        }
    }

    /// Stands in for the browser: follows the redirect straight to the listener.
    struct RedirectingBrowser {
        /// Query to send, `{state}` is substituted
        query: String,
        opened: Mutex<Vec<String>>,
    }

    impl RedirectingBrowser {
        fn new(query: &str) -> Arc<Self> {
            Arc::new(Self {
                query: query.to_string(),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    impl BrowserLauncher for RedirectingBrowser {
        fn open(&self, url: &str) -> std::io::Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            let url = Url::parse(url).unwrap();
            let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            let state = pairs.iter().find(|(k, _)| k == "state").unwrap().1.clone();
            let redirect = pairs
                .iter()
                .find(|(k, _)| k == "redirect_uri")
                .unwrap()
                .1
                .clone();
            let redirect = Url::parse(&redirect).unwrap();
            let addr = format!(
                "{}:{}",
                redirect.host_str().unwrap(),
                redirect.port().unwrap()
            );
            let request = format!(
                "GET {}?{} HTTP/1.1\r\nHost: {}\r\n\r\n",
                redirect.path(),
                self.query.replace("{state}", &state),
                addr
            );
            tokio::spawn(async move {
                let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = Vec::new();
                let _ = stream.read_to_end(&mut response).await;
            });
            Ok(())
        }
    }

    /// Follows the redirect over HTTPS, accepting the self-signed listener.
    struct HttpsBrowser {
        tx: Mutex<Option<oneshot::Sender<u16>>>,
    }

    impl BrowserLauncher for HttpsBrowser {
        fn open(&self, url: &str) -> std::io::Result<()> {
            let url = Url::parse(url).unwrap();
            let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            let lookup = |name: &str| pairs.iter().find(|(k, _)| k == name).unwrap().1.clone();
            let mut callback = Url::parse(&lookup("redirect_uri")).unwrap();
            callback
                .query_pairs_mut()
                .append_pair("code", "TLSCODE")
                .append_pair("state", &lookup("state"));
            let tx = self.tx.lock().unwrap().take();
            tokio::spawn(async move {
                let client = reqwest::Client::builder()
                    .danger_accept_invalid_certs(true)
                    .build()
                    .unwrap();
                let resp = client.get(callback).send().await.unwrap();
                if let Some(tx) = tx {
                    let _ = tx.send(resp.status().as_u16());
                }
            });
            Ok(())
        }
    }

    struct SilentBrowser;

    impl BrowserLauncher for SilentBrowser {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no browser"))
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> AuthConfig {
        AuthConfig {
            client_id: "app-key".into(),
            client_secret: "secret".into(),
            redirect_uri: format!("http://127.0.0.1:{}/callback", port),
            authorize_url: "https://broker.example/v1/oauth/authorize".into(),
            token_url: "https://broker.example/v1/oauth/token".into(),
            scope: None,
        }
    }

    fn port_is_free(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    #[tokio::test]
    async fn test_completed_flow_exchanges_grant_and_releases_port() {
        let port = free_port();
        let endpoint = FakeEndpoint::new(false);
        let browser = RedirectingBrowser::new("code=G123&state={state}");
        let flow = LoopbackFlow::new(config(port), endpoint.clone(), None, browser.clone()).unwrap();

        let cred = flow.run().await.unwrap();
        assert_eq!(cred.access_token, "token-for-G123");
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(browser.opened.lock().unwrap().len(), 1);
        assert!(port_is_free(port));
    }

    #[tokio::test]
    async fn test_callback_without_grant_fails_and_releases_port() {
        let port = free_port();
        let endpoint = FakeEndpoint::new(false);
        let browser = RedirectingBrowser::new("state={state}");
        let flow = LoopbackFlow::new(config(port), endpoint.clone(), None, browser).unwrap();

        let err = flow.run().await.unwrap_err();
        assert!(matches!(err, AuthError::GrantExchange(_)));
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 0);
        assert!(port_is_free(port));
    }

    #[tokio::test]
    async fn test_state_mismatch_fails_flow() {
        let port = free_port();
        let browser = RedirectingBrowser::new("code=G&state=forged");
        let flow =
            LoopbackFlow::new(config(port), FakeEndpoint::new(false), None, browser).unwrap();
        assert!(matches!(
            flow.run().await,
            Err(AuthError::GrantExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_exchange_fails_flow() {
        let port = free_port();
        let browser = RedirectingBrowser::new("code=G&state={state}");
        let flow =
            LoopbackFlow::new(config(port), FakeEndpoint::new(true), None, browser).unwrap();
        assert!(matches!(
            flow.run().await,
            Err(AuthError::GrantExchange(_))
        ));
        assert!(port_is_free(port));
    }

    #[tokio::test]
    async fn test_no_callback_times_out_and_releases_port() {
        let port = free_port();
        let flow = LoopbackFlow::new(config(port), FakeEndpoint::new(false), None, Arc::new(SilentBrowser))
            .unwrap()
            .with_timeouts(FlowTimeouts {
                listener_startup: Duration::from_secs(5),
                callback: Duration::from_millis(200),
            });

        let err = flow.run().await.unwrap_err();
        match &err {
            AuthError::Timeout {
                authorization_url, ..
            } => assert!(authorization_url.contains("client_id=app-key")),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert!(err.authorization_url().is_some());
        assert!(port_is_free(port));
    }

    #[tokio::test]
    async fn test_https_redirect_without_certificate_fails_before_binding() {
        let port = free_port();
        let mut cfg = config(port);
        cfg.redirect_uri = format!("https://127.0.0.1:{}/callback", port);
        let browser = RedirectingBrowser::new("code=G&state={state}");
        let flow = LoopbackFlow::new(cfg, FakeEndpoint::new(false), None, browser.clone()).unwrap();

        assert!(matches!(flow.run().await, Err(AuthError::Certificate(_))));
        assert!(browser.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_https_callback_completes_through_tls_listener() {
        let port = free_port();
        let mut cfg = config(port);
        cfg.redirect_uri = format!("https://127.0.0.1:{}/callback", port);
        let (status_tx, status_rx) = oneshot::channel();
        let browser = Arc::new(HttpsBrowser {
            tx: Mutex::new(Some(status_tx)),
        });
        let certificates: Arc<dyn CertificateProvider> =
            Arc::new(crate::auth::tls::fixture_provider());
        let flow = LoopbackFlow::new(cfg, FakeEndpoint::new(false), Some(certificates), browser)
            .unwrap()
            .with_timeouts(FlowTimeouts {
                listener_startup: Duration::from_secs(10),
                callback: Duration::from_secs(10),
            });

        let cred = flow.run().await.unwrap();
        assert_eq!(cred.access_token, "token-for-TLSCODE");
        assert_eq!(status_rx.await.unwrap(), 200);
        assert!(port_is_free(port));
    }

    #[tokio::test]
    async fn test_manual_flow_accepts_pasted_redirect() {
        let endpoint = FakeEndpoint::new(false);
        let manual = ManualFlow::new(config(8182), endpoint.clone());

        // The real state is random, so paste a redirect without one.
        let pasted = std::io::Cursor::new(b"http://127.0.0.1:8182/callback?code=PASTED%40x\n".to_vec());
        let cred = manual.run_with_reader(pasted).await.unwrap();
        assert_eq!(cred.access_token, "token-for-PASTED@x");
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_flow_rejects_garbage() {
        let manual = ManualFlow::new(config(8182), FakeEndpoint::new(false));
        let pasted = std::io::Cursor::new(b"definitely not a url\n".to_vec());
        assert!(matches!(
            manual.run_with_reader(pasted).await,
            Err(AuthError::GrantExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_flow_times_out_on_silent_input() {
        let manual = ManualFlow::new(config(8182), FakeEndpoint::new(false))
            .with_timeout(Duration::from_millis(100));
        // Writer kept alive so the read never completes
        let (_writer, reader) = tokio::io::duplex(64);

        let started = std::time::Instant::now();
        let result = manual.run_with_reader(BufReader::new(reader)).await;
        assert!(matches!(result, Err(AuthError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
