//! Local process jobs.

use std::fs::File;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::spawn::{self, SpawnedChild};
use super::{JobError, JobStatus, Options, StatusResult};
use crate::output::Buffer;
use crate::resources::Cgroup;

/// Exit code reported for jobs killed by stop: 128 + SIGKILL.
const KILLED_EXIT_CODE: i32 = 128 + libc::SIGKILL;

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    exit_code: Option<i32>,
    /// Pid of the direct child; set only after a successful start.
    child: Option<Pid>,
    /// Pump task copying the child's merged stdio into the output buffer.
    pump: Option<JoinHandle<()>>,
}

/// Manages the lifetime of one local process, and therefore the job's
/// cgroup: once constructed with one, the job is responsible for cleaning it
/// up after the process is reaped.
#[derive(Debug)]
pub struct LocalJob {
    id: Uuid,
    command: String,
    args: Vec<String>,
    output: Arc<Buffer>,
    cgroup: Option<Cgroup>,
    no_cleanup: bool,
    state: Mutex<JobState>,
}

impl LocalJob {
    pub(super) fn new(id: Uuid, command: String, args: Vec<String>, opts: Options) -> Self {
        Self {
            id,
            command,
            args,
            output: Arc::new(Buffer::new()),
            cgroup: opts.cgroup,
            no_cleanup: opts.no_cleanup,
            state: Mutex::new(JobState {
                status: JobStatus::Submitted,
                exit_code: None,
                child: None,
                pump: None,
            }),
        }
    }

    /// The unique job identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The buffer carrying the child's merged stdout/stderr.
    pub fn output(&self) -> &Arc<Buffer> {
        &self.output
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the process, transitioning the job from `Submitted` to
    /// `Running`.
    ///
    /// The child is first cloned into a new PID namespace so descendants die
    /// with the supervisor; if that fails (user namespaces disabled, seccomp
    /// policy, ...) the spawn is retried once without namespaces and a
    /// warning is logged. On failure of both attempts the job's cgroup is
    /// released and the job stays `Submitted`.
    pub fn start(&self) -> Result<(), JobError> {
        let mut state = self.lock();
        if state.status != JobStatus::Submitted {
            return Err(JobError::AlreadyStarted);
        }

        let cgroup_fd = self.cgroup.as_ref().and_then(|cg| cg.fd());
        let spawned = match spawn::spawn(&self.command, &self.args, cgroup_fd, true) {
            Ok(child) => child,
            Err(_) => match spawn::spawn(&self.command, &self.args, cgroup_fd, false) {
                Ok(child) => {
                    tracing::warn!(
                        job_id = %self.id,
                        "PID namespace unavailable, job descendants may survive if the server dies"
                    );
                    child
                }
                Err(err) => {
                    if let Some(cg) = &self.cgroup {
                        if let Err(cleanup_err) = cg.cleanup() {
                            tracing::warn!(
                                job_id = %self.id,
                                error = %cleanup_err,
                                "failed to clean up cgroup after spawn failure"
                            );
                        }
                    }
                    return Err(JobError::Spawn(err));
                }
            },
        };

        let SpawnedChild { pid, output } = spawned;
        state.child = Some(pid);
        state.pump = Some(spawn_pump(Arc::clone(&self.output), output, self.id));
        state.status = JobStatus::Running;
        Ok(())
    }

    /// The current status and exit code.
    pub fn status(&self) -> StatusResult {
        let state = self.lock();
        StatusResult {
            status: state.status,
            exit_code: state.exit_code,
        }
    }

    /// Kills the job and all of its descendants. Returns
    /// [`JobError::NotRunning`] unless the job is currently running.
    ///
    /// When a cgroup is attached, `cgroup.kill` is used: the kernel walks the
    /// group and SIGKILLs every member atomically. Without one, or if that
    /// write fails, SIGKILL goes to the negated pid, i.e. the whole process
    /// group. ESRCH from the fallback means the process won a race and exited
    /// on its own, which counts as success.
    pub fn stop(&self) -> Result<(), JobError> {
        let mut state = self.lock();
        if state.status != JobStatus::Running {
            return Err(JobError::NotRunning);
        }
        let Some(pid) = state.child else {
            return Err(JobError::NotRunning);
        };

        let mut cgroup_failed = false;
        if let Some(cg) = &self.cgroup {
            if let Err(err) = cg.kill() {
                tracing::warn!(
                    job_id = %self.id,
                    error = %err,
                    "failed to kill job via cgroup.kill, falling back to process group signal"
                );
                cgroup_failed = true;
            }
        }

        if self.cgroup.is_none() || cgroup_failed {
            match signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => return Err(JobError::Kill(errno)),
            }
        }

        state.status = JobStatus::Killed;
        state.exit_code = Some(KILLED_EXIT_CODE);
        Ok(())
    }

    /// Blocks until the process is reaped and its output is drained, then
    /// records the terminal status, closes the output buffer, and cleans up
    /// the cgroup. Runs exactly once per started job; it is the sole writer
    /// of terminal state apart from [`stop`](LocalJob::stop).
    pub async fn wait(&self) {
        let (pid, pump) = {
            let mut state = self.lock();
            (state.child, state.pump.take())
        };
        let Some(pid) = pid else {
            return;
        };

        let reaped = tokio::task::spawn_blocking(move || reap(pid)).await;

        // Drain the output pipe to EOF before closing the buffer, so
        // subscribers observe every byte the job's process tree wrote.
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        {
            let mut state = self.lock();
            match reaped {
                Ok(Ok(wait_status)) => apply_wait_status(&mut state, wait_status),
                Ok(Err(errno)) => {
                    tracing::error!(job_id = %self.id, error = %errno, "failed to wait on job process");
                    if state.status != JobStatus::Killed {
                        state.status = JobStatus::Failed;
                    }
                }
                Err(join_err) => {
                    tracing::error!(job_id = %self.id, error = %join_err, "waiter task failed");
                    if state.status != JobStatus::Killed {
                        state.status = JobStatus::Failed;
                    }
                }
            }
        }

        self.output.close();

        if let Some(cg) = &self.cgroup {
            if !self.no_cleanup {
                if let Err(err) = cg.cleanup() {
                    tracing::warn!(job_id = %self.id, error = %err, "failed to clean up cgroup");
                }
            }
        }
    }
}

/// Resolves the reaped wait status into a terminal state. A job already
/// marked `Killed` by stop keeps its status and exit code: stop committed
/// the transition under the mutex first, so it wins the race with a natural
/// exit.
fn apply_wait_status(state: &mut JobState, wait_status: WaitStatus) {
    if state.status == JobStatus::Killed {
        return;
    }
    match wait_status {
        WaitStatus::Exited(_, code) => {
            state.status = if code == 0 {
                JobStatus::Success
            } else {
                JobStatus::Failed
            };
            state.exit_code = Some(code);
        }
        WaitStatus::Signaled(_, sig, _) => {
            state.status = JobStatus::Failed;
            state.exit_code = Some(128 + sig as i32);
        }
        other => {
            tracing::error!(status = ?other, "unexpected wait status for job process");
            state.status = JobStatus::Failed;
        }
    }
}

/// Blocks until the child exits, retrying interrupted waits and ignoring
/// stop/continue events.
fn reap(pid: Pid) -> Result<WaitStatus, Errno> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => return Ok(status),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

/// Copies the child's merged stdio from the pipe into the output buffer
/// until EOF. EOF arrives once every process holding the write side has
/// exited, so descendants' output is captured too.
fn spawn_pump(output: Arc<Buffer>, mut pipe: File, job_id: Uuid) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // The buffer only closes early during shutdown; the rest
                    // of the stream has nowhere to go.
                    if output.write(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to read job output");
                    break;
                }
            }
        }
    })
}
