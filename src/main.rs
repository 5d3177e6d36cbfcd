use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use teleworker::config::{TlsPaths, WorkerConfig};
use teleworker::grpc::GrpcServer;
use teleworker::resources::{self, Manager};
use teleworker::shutdown;
use teleworker::tls::TlsIdentity;
use teleworker::worker::{Options, Worker};

#[derive(Parser, Debug)]
#[command(name = "teleworker")]
#[command(about = "Job execution server with cgroup resource limits and mTLS")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:50051")]
    addr: SocketAddr,

    /// Parent cgroup directory for per-job resource limits
    #[arg(long, default_value = resources::DEFAULT_PARENT)]
    cgroup_parent: PathBuf,

    /// Run jobs without cgroup resource limits (does not require root)
    #[arg(long)]
    no_cgroups: bool,

    /// Path to the CA certificate PEM
    #[arg(long, default_value = "certs/ca.crt")]
    ca: PathBuf,

    /// Path to the server certificate PEM
    #[arg(long, default_value = "certs/server.crt")]
    cert: PathBuf,

    /// Path to the server private key PEM
    #[arg(long, default_value = "certs/server.key")]
    key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    teleworker::logging::init();

    let args = Args::parse();
    let config = WorkerConfig {
        listen_addr: args.addr,
        cgroup_parent: args.cgroup_parent,
        enable_cgroups: !args.no_cgroups,
        tls: TlsPaths {
            ca_cert_path: args.ca,
            cert_path: args.cert,
            key_path: args.key,
        },
    };

    let cgroup_mgr = if config.enable_cgroups {
        let mgr = Manager::new(&config.cgroup_parent)
            .map_err(|err| format!("failed to configure cgroups (requires root): {err}"))?;
        Some(mgr)
    } else {
        tracing::warn!("cgroups disabled, jobs run without resource limits");
        None
    };

    let worker = Arc::new(Worker::new(Options {
        cgroup_mgr,
        no_cleanup: false,
    }));

    let tls = TlsIdentity::load(&config.tls).await?;
    let shutdown = shutdown::install_shutdown_handler();

    tracing::info!(addr = %config.listen_addr, "server listening");
    GrpcServer::new(config.listen_addr, worker, tls, shutdown)
        .run()
        .await?;

    tracing::info!("server finished");
    Ok(())
}
