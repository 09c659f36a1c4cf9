//! One-shot localhost listener that captures the OAuth redirect
//!
//! The listen address and callback path come from the configured
//! redirect URL. The listener is probed over loopback before the browser
//! is pointed at it, and torn down as soon as the flow stops needing it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_native_tls::TlsAcceptor;
use url::Url;

use super::AuthError;

const PROBE_ATTEMPTS: u32 = 20;
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_REQUEST_BYTES: usize = 16 * 1024;

const SUCCESS_HTML: &str = "<html><body><h1>Authorization complete</h1>\
<p>You may close this window and return to the terminal.</p></body></html>";
const ERROR_HTML: &str = "<html><body><h1>Authorization failed</h1>\
<p>You may close this window and retry from the terminal.</p></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not found</h1></body></html>";

/// Redirect target split into the pieces the listener needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RedirectTarget {
    pub fn parse(redirect_uri: &str) -> Result<Self, AuthError> {
        let url = Url::parse(redirect_uri)
            .map_err(|e| AuthError::Configuration(format!("redirect_uri {}: {}", redirect_uri, e)))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(AuthError::Configuration(format!(
                "redirect_uri must use http or https, got {}",
                scheme
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::Configuration("redirect_uri has no host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AuthError::Configuration("redirect_uri has no port".into()))?;
        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

/// What the browser brought back on the callback path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallbackPayload {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackPayload {
    pub fn from_url(url: &Url) -> Self {
        let mut payload = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => payload.code = Some(value.into_owned()),
                "state" => payload.state = Some(value.into_owned()),
                "error" => payload.error = Some(value.into_owned()),
                "error_description" => payload.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        payload
    }

    /// The authorization grant, if the callback carried a usable one.
    pub fn into_grant(self, expected_state: &str) -> Result<String, AuthError> {
        if let Some(error) = self.error {
            let detail = match self.error_description {
                Some(desc) => format!("{}: {}", error, desc),
                None => error,
            };
            return Err(AuthError::GrantExchange(format!(
                "authorization denied ({})",
                detail
            )));
        }
        if let Some(state) = self.state.as_deref() {
            if state != expected_state {
                return Err(AuthError::GrantExchange(
                    "callback state does not match the authorization request".into(),
                ));
            }
        }
        match self.code {
            Some(code) if !code.is_empty() => Ok(code),
            _ => Err(AuthError::GrantExchange(
                "callback is missing the authorization code".into(),
            )),
        }
    }
}

/// Running callback listener.
///
/// Dropping it aborts the accept loop; [`CallbackServer::shutdown`] also
/// waits until the socket has been released.
pub struct CallbackServer {
    addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the redirect target and confirm it accepts connections.
    ///
    /// `done` fires once with the grant (or the reason there is none).
    pub async fn start(
        target: &RedirectTarget,
        acceptor: Option<TlsAcceptor>,
        expected_state: String,
        authorization_url: &str,
        done: oneshot::Sender<Result<String, AuthError>>,
    ) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((target.host.as_str(), target.port))
            .await
            .map_err(|e| AuthError::ListenerStartup {
                detail: describe_bind_error(target, &e),
                authorization_url: authorization_url.to_string(),
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::ListenerStartup {
                detail: format!("could not read listener address: {}", e),
                authorization_url: authorization_url.to_string(),
            })?;
        tracing::debug!("Callback listener bound on {}", addr);

        let task = tokio::spawn(serve(
            listener,
            acceptor,
            target.path.clone(),
            expected_state,
            done,
        ));
        let server = Self {
            addr,
            task: Some(task),
        };

        if let Err(e) = probe(addr, authorization_url).await {
            server.shutdown().await;
            return Err(e);
        }
        tracing::debug!("Callback listener on {} is accepting connections", addr);
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the accept loop and release the port.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Awaiting guarantees the listener future (and its socket) is dropped.
            let _ = task.await;
        }
        tracing::debug!("Callback listener on {} shut down", self.addr);
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn describe_bind_error(target: &RedirectTarget, err: &std::io::Error) -> String {
    let hint = match err.kind() {
        std::io::ErrorKind::AddrInUse => "port is already in use by another process",
        std::io::ErrorKind::PermissionDenied => {
            "permission denied (ports below 1024 need elevated privileges)"
        }
        std::io::ErrorKind::AddrNotAvailable => "address is not available on this machine",
        _ => "check the redirect_uri host and port",
    };
    format!(
        "cannot bind {}:{} ({}): {}",
        target.host, target.port, err, hint
    )
}

/// Loopback connection attempts at a fixed spacing until one succeeds.
async fn probe(addr: SocketAddr, authorization_url: &str) -> Result<(), AuthError> {
    let mut last_err = None;
    for attempt in 1..=PROBE_ATTEMPTS {
        match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => return Ok(()),
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some("connect timed out".to_string()),
        }
        tracing::debug!("Listener probe {}/{} failed", attempt, PROBE_ATTEMPTS);
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    Err(AuthError::ListenerStartup {
        detail: format!(
            "listener on {} was bound but never accepted a loopback connection ({}); \
             a firewall may be blocking local connections",
            addr,
            last_err.unwrap_or_default()
        ),
        authorization_url: authorization_url.to_string(),
    })
}

async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    callback_path: String,
    expected_state: String,
    done: oneshot::Sender<Result<String, AuthError>>,
) {
    // Owned here so aborting the server also aborts every open connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let callback_path = callback_path.clone();
                    let expected_state = expected_state.clone();
                    connections.spawn(async move {
                        serve_connection(stream, peer, acceptor, &callback_path, &expected_state)
                            .await
                    });
                }
                Err(e) => back_off_after_accept_error(&e).await,
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Ok(Some(result)) = joined {
                    let _ = done.send(result);
                    return;
                }
            }
        }
    }
}

/// Accept errors such as EMFILE persist for a while; don't spin on them.
async fn back_off_after_accept_error(err: &std::io::Error) {
    tracing::warn!("Callback accept failed: {}", err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    callback_path: &str,
    expected_state: &str,
) -> Option<Result<String, AuthError>> {
    match acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(CONNECTION_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => handle_connection(tls, callback_path, expected_state).await,
                Ok(Err(e)) => {
                    // Readiness probes and browsers rejecting the certificate land here
                    tracing::debug!("TLS handshake with {} failed: {}", peer, e);
                    None
                }
                Err(_) => {
                    tracing::debug!("TLS handshake with {} timed out", peer);
                    None
                }
            }
        }
        None => handle_connection(stream, callback_path, expected_state).await,
    }
}

/// Serve one connection. Returns `Some` once the callback path was hit.
async fn handle_connection<S>(
    mut stream: S,
    callback_path: &str,
    expected_state: &str,
) -> Option<Result<String, AuthError>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match tokio::time::timeout(CONNECTION_TIMEOUT, read_request_head(&mut stream))
        .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            tracing::debug!("Callback read failed: {}", e);
            return None;
        }
        Err(_) => {
            tracing::debug!("Callback request timed out");
            return None;
        }
    };
    if request.is_empty() {
        // Readiness probe or a browser pre-connect
        return None;
    }

    let url = match parse_request_target(&request) {
        Some(url) => url,
        None => {
            write_response(&mut stream, "400 Bad Request", ERROR_HTML).await;
            return None;
        }
    };
    if url.path() != callback_path {
        tracing::debug!("Ignoring request for {}", url.path());
        write_response(&mut stream, "404 Not Found", NOT_FOUND_HTML).await;
        return None;
    }

    let result = CallbackPayload::from_url(&url).into_grant(expected_state);
    match &result {
        Ok(_) => write_response(&mut stream, "200 OK", SUCCESS_HTML).await,
        Err(e) => {
            tracing::warn!("Callback rejected: {}", e);
            write_response(&mut stream, "400 Bad Request", ERROR_HTML).await
        }
    }
    Some(result)
}

/// Read up to the end of the request headers.
async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Request-line target of a GET, resolved against a dummy origin.
fn parse_request_target(request: &str) -> Option<Url> {
    let first = request.lines().next()?;
    let mut parts = first.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" || !target.starts_with('/') {
        return None;
    }
    Url::parse(&format!("http://localhost{}", target)).ok()
}

async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
