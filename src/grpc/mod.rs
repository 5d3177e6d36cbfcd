//! gRPC transport: the TeleWorker service implementation and the mTLS
//! server wrapper.

pub mod server;
pub mod service;

pub use server::GrpcServer;
pub use service::TeleWorkerService;
