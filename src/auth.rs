//! Caller identity, extracted from the verified client TLS certificate.

use tonic::{Request, Status};
use x509_parser::prelude::*;

/// Role carried in the first OU of the certificate subject. Anything other
/// than `admin` is a regular user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller: CN from the certificate subject is the
/// username, the first OU the role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Extracts the caller's identity from the request's verified peer
/// certificate chain.
pub fn identity_from_request<T>(request: &Request<T>) -> Result<Identity, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::permission_denied("peer is not using mTLS"))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Status::permission_denied("no verified client certificate"))?;
    identity_from_der(leaf.as_ref())
}

/// Parses a DER certificate's subject into an [`Identity`].
pub fn identity_from_der(der: &[u8]) -> Result<Identity, Status> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|err| {
        tracing::warn!(error = %err, "failed to parse peer certificate");
        Status::permission_denied("invalid client certificate")
    })?;

    let subject = cert.subject();
    let username = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let role = match subject
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
    {
        Some("admin") => Role::Admin,
        _ => Role::User,
    };

    Ok(Identity { username, role })
}
