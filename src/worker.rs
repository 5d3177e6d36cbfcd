//! Job registry: names jobs, binds them to owners, and dispatches lifecycle
//! operations.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::Identity;
use crate::job::{self, JobError, JobType, LocalJob, StatusResult};
use crate::output::Subscriber;
use crate::resources::{Manager, ResourceError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job not found")]
    JobNotFound,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to create cgroup: {0}")]
    Resources(#[from] ResourceError),
}

struct JobEntry {
    job: Arc<LocalJob>,
    owner: Identity,
}

/// Options for constructing a [`Worker`].
#[derive(Default)]
pub struct Options {
    /// Cgroup manager for per-job resource limits. `None` runs every job
    /// without limits and without cgroup-based kill.
    pub cgroup_mgr: Option<Manager>,
    /// Skip cgroup cleanup when jobs exit, so tests can inspect the group
    /// directory after a job finishes.
    pub no_cleanup: bool,
}

/// Manages a set of running jobs.
///
/// Finished jobs are never removed from the map; a long-running deployment
/// would need an expiry mechanism to bound memory growth.
pub struct Worker {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    cgroup_mgr: Option<Manager>,
    no_cleanup: bool,
}

impl Worker {
    pub fn new(opts: Options) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            cgroup_mgr: opts.cgroup_mgr,
            no_cleanup: opts.no_cleanup,
        }
    }

    /// Starts a command and returns the new job's id. The owner is recorded
    /// for authorization checks. On any failure before the job is tracked,
    /// partially created resources are released.
    pub async fn start_job(
        &self,
        job_type: JobType,
        command: String,
        args: Vec<String>,
        owner: Identity,
    ) -> Result<Uuid, WorkerError> {
        let job_id = Uuid::new_v4();

        let cgroup = match &self.cgroup_mgr {
            Some(mgr) => Some(mgr.create_cgroup(job_id)?),
            None => None,
        };

        let job = Arc::new(job::new_job(
            job_type,
            job_id,
            command,
            args,
            job::Options {
                cgroup,
                no_cleanup: self.no_cleanup,
            },
        ));

        // start releases the cgroup itself when the spawn fails.
        job.start()?;

        self.jobs.write().await.insert(
            job_id,
            JobEntry {
                job: Arc::clone(&job),
                owner,
            },
        );

        tokio::spawn(async move { job.wait().await });

        Ok(job_id)
    }

    async fn get_job(&self, job_id: &Uuid) -> Result<Arc<LocalJob>, WorkerError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or(WorkerError::JobNotFound)
    }

    /// The identity of the job's owner.
    pub async fn job_owner(&self, job_id: &Uuid) -> Result<Identity, WorkerError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|entry| entry.owner.clone())
            .ok_or(WorkerError::JobNotFound)
    }

    /// The status and exit code for a job.
    pub async fn job_status(&self, job_id: &Uuid) -> Result<StatusResult, WorkerError> {
        Ok(self.get_job(job_id).await?.status())
    }

    /// A subscriber for the job's combined stdout/stderr, starting at byte 0.
    pub async fn stream_output(&self, job_id: &Uuid) -> Result<Subscriber, WorkerError> {
        Ok(self.get_job(job_id).await?.output().subscribe())
    }

    /// Kills a running job.
    pub async fn stop_job(&self, job_id: &Uuid) -> Result<(), WorkerError> {
        let job = self.get_job(job_id).await?;
        tracing::info!(job_id = %job_id, "stopping job");
        Ok(job.stop()?)
    }

    /// Stops every job and closes its output buffer, unblocking all stream
    /// subscribers so in-flight streaming RPCs can return during graceful
    /// shutdown.
    pub async fn shutdown(&self) {
        let jobs: Vec<Arc<LocalJob>> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.job))
            .collect();

        for job in jobs {
            // Jobs that already finished report not-running; that is fine.
            let _ = job.stop();
            job.output().close();
        }
    }
}
