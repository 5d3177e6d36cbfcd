//! Job types and a factory for constructing them.

mod local;
mod spawn;

pub use local::LocalJob;

use std::io;

use thiserror::Error;
use uuid::Uuid;

use crate::resources::Cgroup;

/// Current state of a job. Status advances monotonically from `Submitted`
/// through `Running` to exactly one terminal state and never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Running,
    Success,
    Failed,
    Killed,
}

impl JobStatus {
    /// True for `Success`, `Failed`, and `Killed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Killed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

/// The kind of job to run. Only local processes today; the variant exists so
/// other backends (e.g. containers) can be added without changing callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Local,
}

/// Status and optional exit code for a job. The exit code is absent while
/// the job has not exited; jobs killed by a signal report 128 + the signal
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job already started")]
    AlreadyStarted,

    #[error("job not running")]
    NotRunning,

    #[error("failed to start command: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to kill process group: {0}")]
    Kill(#[source] nix::errno::Errno),
}

/// Options for job construction.
#[derive(Debug, Default)]
pub struct Options {
    /// Resource limits for the job; `None` runs without cgroups, in which
    /// case stop falls back to signalling the process group.
    pub cgroup: Option<Cgroup>,
    /// Skip cgroup cleanup when the job exits, so tests can inspect the
    /// group directory afterwards.
    pub no_cleanup: bool,
}

/// Constructs a job of the given type.
pub fn new_job(
    job_type: JobType,
    id: Uuid,
    command: String,
    args: Vec<String>,
    opts: Options,
) -> LocalJob {
    match job_type {
        JobType::Local => LocalJob::new(id, command, args, opts),
    }
}
