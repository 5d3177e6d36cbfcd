//! TLS material loading for mutual TLS.
//!
//! Both the server and the client verify their peer against a shared CA; the
//! server additionally requires a client certificate, whose subject carries
//! the caller's identity.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsPaths;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Loaded TLS materials: this endpoint's certificate + key, and the CA used
/// to verify peers.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Loads PEM files from the given paths.
    pub async fn load(paths: &TlsPaths) -> Result<Self, TlsError> {
        if !paths.ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(paths.ca_cert_path.clone()));
        }
        if !paths.cert_path.exists() {
            return Err(TlsError::CertNotFound(paths.cert_path.clone()));
        }
        if !paths.key_path.exists() {
            return Err(TlsError::KeyNotFound(paths.key_path.clone()));
        }

        let ca_pem = fs::read(&paths.ca_cert_path).await?;
        let cert_pem = fs::read(&paths.cert_path).await?;
        let key_pem = fs::read(&paths.key_path).await?;

        Ok(Self::from_pem(&ca_pem, &cert_pem, &key_pem))
    }

    /// Builds materials from in-memory PEM data.
    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Self {
        Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        }
    }

    /// Server-side config: presents this endpoint's certificate and requires
    /// clients to present one signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client-side config: presents this endpoint's certificate and verifies
    /// the server against the CA under the given name.
    pub fn client_tls_config(&self, server_name: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(server_name)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_nonexistent_ca_fails_first() {
        let paths = TlsPaths {
            ca_cert_path: PathBuf::from("/nonexistent/ca.crt"),
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
        };
        let result = TlsIdentity::load(&paths).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[tokio::test]
    async fn load_reports_which_file_is_missing() {
        let dir = std::env::temp_dir();
        let ca = dir.join(format!("teleworker-tls-test-{}.crt", std::process::id()));
        std::fs::write(&ca, "not a real cert").expect("failed to write test file");

        let paths = TlsPaths {
            ca_cert_path: ca.clone(),
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
        };
        let result = TlsIdentity::load(&paths).await;
        assert!(matches!(result, Err(TlsError::CertNotFound(_))));

        std::fs::remove_file(&ca).expect("failed to remove test file");
    }
}
