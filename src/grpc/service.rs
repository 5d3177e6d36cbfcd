use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::auth::{self, Identity};
use crate::job::{JobError, JobStatus, JobType};
use crate::proto::tele_worker_server::TeleWorker;
use crate::proto::{
    GetJobStatusRequest, GetJobStatusResponse, JobStatus as ProtoJobStatus,
    JobType as ProtoJobType, StartJobRequest, StartJobResponse, StopJobRequest, StopJobResponse,
    StreamOutputRequest, StreamOutputResponse,
};
use crate::worker::{Worker, WorkerError};

const JOB_NOT_FOUND: &str = "job not found";

/// gRPC service dispatching job operations to the [`Worker`].
pub struct TeleWorkerService {
    worker: Arc<Worker>,
}

impl TeleWorkerService {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// Checks that the caller may access the given job. Admins may access
    /// any job; regular users only their own. Both an unknown id and an
    /// ownership mismatch surface as NotFound, so valid ids owned by other
    /// users are not revealed.
    async fn authorize<T>(
        &self,
        request: &Request<T>,
        job_id: &str,
    ) -> Result<(Identity, Uuid), Status> {
        let identity = auth::identity_from_request(request)?;
        let job_id = parse_job_id(job_id)?;

        if identity.is_admin() {
            return Ok((identity, job_id));
        }

        let owner = self
            .worker
            .job_owner(&job_id)
            .await
            .map_err(|_| Status::not_found(JOB_NOT_FOUND))?;
        if owner.username != identity.username {
            return Err(Status::not_found(JOB_NOT_FOUND));
        }
        Ok((identity, job_id))
    }
}

#[tonic::async_trait]
impl TeleWorker for TeleWorkerService {
    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        let identity = auth::identity_from_request(&request)?;
        let req = request.into_inner();

        if req.command.is_empty() {
            return Err(Status::invalid_argument("command must not be empty"));
        }
        let job_type = match ProtoJobType::try_from(req.job_type) {
            Ok(ProtoJobType::Unspecified | ProtoJobType::Local) => JobType::Local,
            _ => return Err(Status::invalid_argument("unknown job type")),
        };

        let job_id = self
            .worker
            .start_job(job_type, req.command.clone(), req.args.clone(), identity.clone())
            .await
            .map_err(|err| Status::internal(format!("failed to start job: {err}")))?;

        tracing::info!(
            job_id = %job_id,
            command = %req.command,
            args = ?req.args,
            user = %identity.username,
            "started job"
        );

        Ok(Response::new(StartJobResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let job_id_str = request.get_ref().job_id.clone();
        let (_, job_id) = self.authorize(&request, &job_id_str).await?;

        let result = self
            .worker
            .job_status(&job_id)
            .await
            .map_err(|err| match err {
                WorkerError::JobNotFound => Status::not_found(JOB_NOT_FOUND),
                other => Status::internal(format!("failed to get job status: {other}")),
            })?;

        Ok(Response::new(GetJobStatusResponse {
            job_id: job_id_str,
            status: status_to_proto(result.status) as i32,
            exit_code: result.exit_code,
        }))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let job_id_str = request.get_ref().job_id.clone();
        let (_, job_id) = self.authorize(&request, &job_id_str).await?;

        self.worker.stop_job(&job_id).await.map_err(|err| match err {
            WorkerError::JobNotFound => Status::not_found(JOB_NOT_FOUND),
            WorkerError::Job(JobError::NotRunning) => {
                Status::failed_precondition("job is not running")
            }
            other => Status::internal(format!("failed to stop job: {other}")),
        })?;

        Ok(Response::new(StopJobResponse {}))
    }

    type StreamOutputStream = ReceiverStream<Result<StreamOutputResponse, Status>>;

    async fn stream_output(
        &self,
        request: Request<StreamOutputRequest>,
    ) -> Result<Response<Self::StreamOutputStream>, Status> {
        let job_id_str = request.get_ref().job_id.clone();
        let (_, job_id) = self.authorize(&request, &job_id_str).await?;

        let mut subscriber = self
            .worker
            .stream_output(&job_id)
            .await
            .map_err(|_| Status::not_found(JOB_NOT_FOUND))?;

        let (tx, rx) = mpsc::channel::<Result<StreamOutputResponse, Status>>(16);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    // The client went away; close the subscriber so nothing
                    // keeps waiting on its behalf.
                    _ = tx.closed() => {
                        subscriber.close();
                        break;
                    }
                    read = subscriber.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = StreamOutputResponse {
                                data: buf[..n].to_vec(),
                            };
                            if tx.send(Ok(chunk)).await.is_err() {
                                subscriber.close();
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = tx
                                .send(Err(Status::cancelled("stream cancelled")))
                                .await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn parse_job_id(job_id: &str) -> Result<Uuid, Status> {
    // Malformed ids are indistinguishable from unknown ones.
    Uuid::parse_str(job_id).map_err(|_| Status::not_found(JOB_NOT_FOUND))
}

fn status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::Submitted => ProtoJobStatus::Submitted,
        JobStatus::Running => ProtoJobStatus::Running,
        JobStatus::Success => ProtoJobStatus::Success,
        JobStatus::Failed => ProtoJobStatus::Failed,
        JobStatus::Killed => ProtoJobStatus::Killed,
    }
}
