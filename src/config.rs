use std::net::SocketAddr;
use std::path::PathBuf;

use crate::resources;

/// Paths to the PEM files making up one endpoint's TLS identity.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub ca_cert_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Server configuration, assembled from command-line flags.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Parent directory for per-job control groups.
    pub cgroup_parent: PathBuf,
    /// When false, jobs run without resource limits (and without
    /// cgroup-based kill). Intended for unprivileged deployments.
    pub enable_cgroups: bool,
    pub tls: TlsPaths,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            cgroup_parent: PathBuf::from(resources::DEFAULT_PARENT),
            enable_cgroups: true,
            tls: TlsPaths {
                ca_cert_path: PathBuf::from("certs/ca.crt"),
                cert_path: PathBuf::from("certs/server.crt"),
                key_path: PathBuf::from("certs/server.key"),
            },
        }
    }
}
