//! TLS server context for the local callback listener

use std::fs;
use std::path::PathBuf;

use tokio_native_tls::TlsAcceptor;

use super::AuthError;

/// Supplies a TLS server context for a local hostname.
pub trait CertificateProvider: Send + Sync {
    fn server_context(&self, host: &str) -> Result<TlsAcceptor, AuthError>;
}

/// Loads a PEM certificate chain and PKCS#8 private key from disk.
///
/// The pair must be trusted by the browser for `host` (for example one
/// issued by a locally installed development CA).
#[derive(Debug, Clone)]
pub struct PemCertificateProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemCertificateProvider {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl CertificateProvider for PemCertificateProvider {
    fn server_context(&self, host: &str) -> Result<TlsAcceptor, AuthError> {
        let cert = fs::read(&self.cert_path).map_err(|e| {
            AuthError::Certificate(format!(
                "cannot read certificate {}: {}",
                self.cert_path.display(),
                e
            ))
        })?;
        let key = fs::read(&self.key_path).map_err(|e| {
            AuthError::Certificate(format!(
                "cannot read private key {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|e| AuthError::Certificate(format!("invalid certificate/key pair: {}", e)))?;
        let acceptor = native_tls::TlsAcceptor::new(identity)
            .map_err(|e| AuthError::Certificate(format!("TLS setup failed: {}", e)))?;

        tracing::debug!(
            "Loaded TLS identity for {} from {}",
            host,
            self.cert_path.display()
        );
        Ok(TlsAcceptor::from(acceptor))
    }
}

/// Self-signed pair for 127.0.0.1 / localhost, checked in for tests.
#[cfg(test)]
pub(crate) fn fixture_provider() -> PemCertificateProvider {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("src/auth/testdata");
    PemCertificateProvider::new(dir.join("localhost.crt"), dir.join("localhost.key"))
}
