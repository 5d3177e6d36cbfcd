//! Cgroup v2 resource controls for jobs.
//!
//! Every job gets its own control group under a parent directory, with fixed
//! CPU, memory, and block-I/O ceilings. The group's directory handle is kept
//! open so the child can be cloned directly into the group, and `cgroup.kill`
//! gives the kernel-level kill primitive used by stop.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use uuid::Uuid;

/// Default parent directory for per-job control groups.
pub const DEFAULT_PARENT: &str = "/sys/fs/cgroup/teleworker";

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

// Uniform limits for every job: 1 full core (100ms quota per 100ms period),
// 500 MiB of memory, 5 MiB/s of read and write block I/O.
const CPU_MAX: &str = "100000 100000";
const MEMORY_MAX: &str = "524288000";
const IO_BPS: u64 = 5_242_880;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("cgroup v2 not available: {0}")]
    Unavailable(#[source] io::Error),

    #[error("failed to create cgroup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open cgroup directory {path}: {source}")]
    OpenDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove cgroup directory {path}: {source}")]
    RemoveDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Creates and configures per-job control groups under one parent directory.
#[derive(Debug)]
pub struct Manager {
    parent_path: PathBuf,
}

impl Manager {
    /// Verifies cgroup v2 is available, reaps anything left over from a
    /// previous run of the same parent, creates the parent directory, and
    /// enables the cpu/memory/io controllers for child groups.
    pub fn new(parent_path: impl Into<PathBuf>) -> Result<Self, ResourceError> {
        let parent_path = parent_path.into();

        if let Err(err) = fs::metadata(Path::new(CGROUP_ROOT).join("cgroup.controllers")) {
            return Err(ResourceError::Unavailable(err));
        }

        // Kill stale processes and remove directories left over from a
        // previous run (e.g. if the server was killed with SIGKILL).
        cleanup_stale_dir(&parent_path);

        fs::create_dir_all(&parent_path).map_err(|source| ResourceError::CreateDir {
            path: parent_path.clone(),
            source,
        })?;

        write_cgroup_file(&parent_path.join("cgroup.subtree_control"), "+cpu +memory +io")?;

        Ok(Self { parent_path })
    }

    /// The parent directory this manager owns.
    pub fn parent_path(&self) -> &Path {
        &self.parent_path
    }

    /// Creates a control group for the given job, writes the resource limits,
    /// and opens a directory handle for use with `CLONE_INTO_CGROUP`.
    pub fn create_cgroup(&self, job_id: Uuid) -> Result<Cgroup, ResourceError> {
        let path = self.parent_path.join(job_id.to_string());
        fs::create_dir(&path).map_err(|source| ResourceError::CreateDir {
            path: path.clone(),
            source,
        })?;

        if let Err(err) = write_cgroup_file(&path.join("cpu.max"), CPU_MAX) {
            remove_dir_logged(&path);
            return Err(err);
        }

        if let Err(err) = write_cgroup_file(&path.join("memory.max"), MEMORY_MAX) {
            remove_dir_logged(&path);
            return Err(err);
        }

        // io.max is best-effort: the limit targets the block device backing
        // `/`, and layouts like device-mapper or multi-device filesystems can
        // reject the write. A job without an io ceiling is still usable.
        match root_io_max() {
            Ok(io_max) => {
                if let Err(err) = fs::write(path.join("io.max"), &io_max) {
                    tracing::warn!(
                        path = %path.display(),
                        payload = %io_max,
                        error = %err,
                        "failed to set io.max"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to resolve io.max device");
            }
        }

        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&path)
            .map_err(|source| {
                remove_dir_logged(&path);
                ResourceError::OpenDir {
                    path: path.clone(),
                    source,
                }
            })?;

        Ok(Cgroup {
            path,
            dir: Mutex::new(Some(dir)),
        })
    }

    /// Best-effort teardown of the parent directory and any remaining child
    /// groups. Used by tests; the server relies on the stale sweep at the
    /// next startup instead.
    pub fn cleanup(&self) {
        cleanup_stale_dir(&self.parent_path);
    }
}

/// A single job's control group.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    dir: Mutex<Option<File>>,
}

impl Cgroup {
    /// The group's directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory file descriptor for atomic child placement at clone
    /// time. `None` once [`cleanup`](Cgroup::cleanup) has run.
    pub fn fd(&self) -> Option<RawFd> {
        self.dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.as_raw_fd())
    }

    /// Writes `1` to `cgroup.kill`, which makes the kernel SIGKILL every
    /// process in the group. Succeeds on an empty group.
    pub fn kill(&self) -> io::Result<()> {
        fs::write(self.path.join("cgroup.kill"), "1")
    }

    /// Closes the directory handle and removes the group directory.
    pub fn cleanup(&self) -> Result<(), ResourceError> {
        drop(
            self.dir
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        fs::remove_dir(&self.path).map_err(|source| ResourceError::RemoveDir {
            path: self.path.clone(),
            source,
        })
    }
}

fn write_cgroup_file(path: &Path, content: &str) -> Result<(), ResourceError> {
    fs::write(path, content).map_err(|source| ResourceError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_dir_logged(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove cgroup directory");
    }
}

/// Kills any processes in the directory's cgroup subtree and removes the
/// tree. Errors are logged as warnings; an unclean previous shutdown must not
/// prevent startup.
fn cleanup_stale_dir(dir: &Path) {
    // A write failure means the directory does not exist yet.
    if fs::write(dir.join("cgroup.kill"), "1").is_err() {
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        if let Err(err) = fs::remove_dir(entry.path()) {
            tracing::warn!(
                path = %entry.path().display(),
                error = %err,
                "failed to remove stale child cgroup"
            );
        }
    }
    if let Err(err) = fs::remove_dir(dir) {
        tracing::warn!(path = %dir.display(), error = %err, "failed to remove stale parent cgroup");
    }
}

/// Builds the `io.max` payload for the block device backing `/`.
///
/// The filesystem device's major number is paired with minor 0; on
/// multi-device or device-mapper setups this may name the wrong device, which
/// is why the caller treats the write as best-effort.
fn root_io_max() -> io::Result<String> {
    let meta = fs::metadata("/")?;
    let major = libc::major(meta.dev());
    Ok(format!("{major}:0 rbps={IO_BPS} wbps={IO_BPS}"))
}
