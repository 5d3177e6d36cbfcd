use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::TeleWorkerService;
use crate::proto::tele_worker_server::TeleWorkerServer;
use crate::tls::TlsIdentity;
use crate::worker::Worker;

/// The TeleWorker gRPC server with mutual TLS.
pub struct GrpcServer {
    addr: SocketAddr,
    worker: Arc<Worker>,
    tls: TlsIdentity,
    shutdown: CancellationToken,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        worker: Arc<Worker>,
        tls: TlsIdentity,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr,
            worker,
            tls,
            shutdown,
        }
    }

    /// Serves until the shutdown token fires, then closes all job output
    /// buffers (unblocking in-flight streams) and drains gracefully.
    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        let service = TeleWorkerService::new(Arc::clone(&self.worker));

        tracing::info!(addr = %self.addr, "starting gRPC server");

        let worker = self.worker;
        let shutdown = self.shutdown;
        Server::builder()
            .tls_config(self.tls.server_tls_config())?
            .add_service(TeleWorkerServer::new(service))
            .serve_with_shutdown(self.addr, async move {
                shutdown.cancelled().await;
                tracing::info!("draining server, unblocking output streams");
                worker.shutdown().await;
            })
            .await
    }
}
