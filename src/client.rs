//! Typed gRPC client for the TeleWorker service.

use thiserror::Error;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Streaming;

use crate::job::JobStatus;
use crate::proto::tele_worker_client::TeleWorkerClient;
use crate::proto::{
    GetJobStatusRequest, JobStatus as ProtoJobStatus, JobType as ProtoJobType, StartJobRequest,
    StopJobRequest, StreamOutputRequest, StreamOutputResponse,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address: {0}")]
    Address(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("server returned unknown job status {0}")]
    UnknownStatus(i32),
}

/// A connection to a TeleWorker server over mutual TLS. Cloning is cheap
/// and clones share the underlying channel.
#[derive(Clone)]
pub struct Client {
    inner: TeleWorkerClient<Channel>,
}

impl Client {
    /// Connects to `addr` (host:port) using the given TLS configuration.
    pub async fn connect(addr: &str, tls: ClientTlsConfig) -> Result<Self, ClientError> {
        let endpoint = Channel::from_shared(format!("https://{addr}"))
            .map_err(|err| ClientError::Address(err.to_string()))?
            .tls_config(tls)?;
        let channel = endpoint.connect().await?;
        Ok(Self {
            inner: TeleWorkerClient::new(channel),
        })
    }

    /// Starts a job and returns its id.
    pub async fn start_job(
        &mut self,
        command: String,
        args: Vec<String>,
    ) -> Result<String, ClientError> {
        let response = self
            .inner
            .start_job(StartJobRequest {
                command,
                args,
                job_type: ProtoJobType::Local as i32,
            })
            .await?;
        Ok(response.into_inner().job_id)
    }

    /// Returns the job's status and, once it has exited, its exit code.
    pub async fn job_status(
        &mut self,
        job_id: &str,
    ) -> Result<(JobStatus, Option<i32>), ClientError> {
        let response = self
            .inner
            .get_job_status(GetJobStatusRequest {
                job_id: job_id.to_string(),
            })
            .await?
            .into_inner();
        let status = status_from_proto(response.status)?;
        Ok((status, response.exit_code))
    }

    /// Stops a running job.
    pub async fn stop_job(&mut self, job_id: &str) -> Result<(), ClientError> {
        self.inner
            .stop_job(StopJobRequest {
                job_id: job_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Opens a stream over the job's combined stdout/stderr, from byte 0.
    pub async fn stream_output(
        &mut self,
        job_id: &str,
    ) -> Result<Streaming<StreamOutputResponse>, ClientError> {
        let response = self
            .inner
            .stream_output(StreamOutputRequest {
                job_id: job_id.to_string(),
            })
            .await?;
        Ok(response.into_inner())
    }
}

fn status_from_proto(status: i32) -> Result<JobStatus, ClientError> {
    match ProtoJobStatus::try_from(status) {
        Ok(ProtoJobStatus::Submitted) => Ok(JobStatus::Submitted),
        Ok(ProtoJobStatus::Running) => Ok(JobStatus::Running),
        Ok(ProtoJobStatus::Success) => Ok(JobStatus::Success),
        Ok(ProtoJobStatus::Failed) => Ok(JobStatus::Failed),
        Ok(ProtoJobStatus::Killed) => Ok(JobStatus::Killed),
        _ => Err(ClientError::UnknownStatus(status)),
    }
}
