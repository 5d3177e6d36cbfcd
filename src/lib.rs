pub mod auth;
pub mod client;
pub mod config;
pub mod grpc;
pub mod job;
pub mod logging;
pub mod output;
pub mod resources;
pub mod shutdown;
pub mod tls;
pub mod worker;

// Generated protobuf types
pub mod proto {
    tonic::include_proto!("teleworker.v1");
}
