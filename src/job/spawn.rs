//! Low-level child spawning via `clone3(2)`.
//!
//! A job's child must satisfy three constraints the standard spawn path
//! cannot express together:
//!
//! - it must be placed in its cgroup atomically (`CLONE_INTO_CGROUP`), so it
//!   is inside its limits from its first instruction;
//! - it should live in a fresh PID namespace, so that when the direct child
//!   (PID 1 there) is SIGKILLed via the parent-death signal, the kernel also
//!   SIGKILLs every descendant;
//! - it must lead a new process group, so the whole job can be signalled at
//!   once when cgroups are unavailable.
//!
//! Running as non-root, a new PID namespace additionally requires a new user
//! namespace with the caller's uid/gid mapped into it; the child writes its
//! own identity mapping, which the kernel permits because it holds full
//! capabilities in the namespace it was created in.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{self, Pid};

// CLONE_INTO_CGROUP is a clone3-only flag (kernel 5.7+); it does not fit in
// the 32-bit flag word older clone variants use.
const CLONE_INTO_CGROUP: u64 = 0x200000000;

/// Argument block for the `clone3` syscall, per `linux/sched.h`.
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// A successfully spawned child: its pid and the read side of the pipe that
/// carries its merged stdout/stderr.
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub pid: Pid,
    pub output: File,
}

/// Spawns `command` with `args`, stdin on `/dev/null` and stdout/stderr
/// merged onto a single pipe. The child becomes a process group leader,
/// receives SIGKILL when this process dies, and, when `cgroup_fd` is given,
/// starts life inside that cgroup. With `use_pid_namespace` the child is
/// cloned into a new PID namespace (plus a user namespace when not root).
///
/// Exec failures in the child (e.g. command not found) are reported back
/// through a close-on-exec status pipe and surface as an error here, after
/// the dead child has been reaped.
pub(crate) fn spawn(
    command: &str,
    args: &[String],
    cgroup_fd: Option<RawFd>,
    use_pid_namespace: bool,
) -> io::Result<SpawnedChild> {
    // Everything the child touches is prepared up front: between clone3 and
    // exec only async-signal-safe calls are allowed, so no allocation may
    // happen on the child side.
    let program = cstring(command)?;
    let mut argv_c = Vec::with_capacity(args.len() + 1);
    argv_c.push(program);
    for arg in args {
        argv_c.push(cstring(arg)?);
    }
    let mut argv: Vec<*const libc::c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    // All of these fds carry O_CLOEXEC, so after the child dup2's the stdio
    // targets into place, exec closes every stray copy.
    let (output_r, output_w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (status_r, status_w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let devnull = File::open("/dev/null")?;

    let uid = unistd::getuid();
    let gid = unistd::getgid();
    let parent_pid = unistd::getpid();
    let map_ids = use_pid_namespace && !uid.is_root();
    let uid_map = format!("{} {} 1", uid.as_raw(), uid.as_raw());
    let gid_map = format!("{} {} 1", gid.as_raw(), gid.as_raw());

    let mut flags: u64 = 0;
    if use_pid_namespace {
        flags |= libc::CLONE_NEWPID as u64;
        if map_ids {
            flags |= libc::CLONE_NEWUSER as u64;
        }
    }
    let mut clone_args = CloneArgs {
        flags,
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };
    if let Some(fd) = cgroup_fd {
        clone_args.flags |= CLONE_INTO_CGROUP;
        clone_args.cgroup = fd as u64;
    }

    // SAFETY: clone3 with a null stack behaves like fork; the child resumes
    // here with copy-on-write memory. The child branch below only performs
    // async-signal-safe work and never returns.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut clone_args as *mut CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if ret == 0 {
        // SAFETY: child side; every pointer and fd was prepared before the
        // clone, and the function diverges via exec or _exit.
        unsafe {
            child_after_clone(
                &argv,
                devnull.as_raw_fd(),
                output_w.as_raw_fd(),
                status_w.as_raw_fd(),
                map_ids,
                uid_map.as_bytes(),
                gid_map.as_bytes(),
                parent_pid.as_raw(),
            )
        }
    }
    let pid = Pid::from_raw(ret as libc::pid_t);

    // Close our copies of the child-side fds, then wait for the status pipe:
    // EOF means exec succeeded (O_CLOEXEC closed the write side); bytes mean
    // the child reported an errno and exited.
    drop(output_w);
    drop(status_w);
    drop(devnull);

    let mut status = File::from(status_r);
    let mut errno_buf = [0u8; 4];
    let n = read_full(&mut status, &mut errno_buf)?;
    if n > 0 {
        // Reap the dead child so it does not linger as a zombie.
        let _ = waitpid(pid, None);
        let errno = i32::from_ne_bytes(errno_buf);
        return Err(io::Error::from_raw_os_error(errno));
    }

    Ok(SpawnedChild {
        pid,
        output: File::from(output_r),
    })
}

fn cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "argument contains an interior NUL byte",
        )
    })
}

fn read_full(f: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Child-side setup between clone and exec. Only async-signal-safe calls.
///
/// # Safety
///
/// Must only be called in the child of a fork-like clone3, with `argv`
/// null-terminated and every fd valid.
unsafe fn child_after_clone(
    argv: &[*const libc::c_char],
    devnull: RawFd,
    output_w: RawFd,
    status_w: RawFd,
    map_ids: bool,
    uid_map: &[u8],
    gid_map: &[u8],
    parent_pid: libc::pid_t,
) -> ! {
    // Lead a new process group so the job can be signalled as a group.
    if libc::setpgid(0, 0) != 0 {
        child_fail(status_w);
    }

    // Die together with the supervisor, even when it is SIGKILLed.
    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
        child_fail(status_w);
    }
    // The parent may have died before the prctl landed, in which case the
    // signal was never armed. getppid reports 0 from inside a new PID
    // namespace, so only a reparent outside the namespace is detectable.
    let ppid = libc::getppid();
    if ppid != 0 && ppid != parent_pid {
        libc::raise(libc::SIGKILL);
    }

    if map_ids {
        // Write our own identity mapping into the new user namespace.
        // setgroups must be denied first or the gid_map write is refused.
        if !write_proc_file(c"/proc/self/setgroups", b"deny")
            || !write_proc_file(c"/proc/self/uid_map", uid_map)
            || !write_proc_file(c"/proc/self/gid_map", gid_map)
        {
            child_fail(status_w);
        }
    }

    if libc::dup2(devnull, libc::STDIN_FILENO) < 0
        || libc::dup2(output_w, libc::STDOUT_FILENO) < 0
        || libc::dup2(output_w, libc::STDERR_FILENO) < 0
    {
        child_fail(status_w);
    }

    libc::execvp(argv[0], argv.as_ptr());
    child_fail(status_w)
}

/// Reports errno to the parent over the status pipe and exits.
unsafe fn child_fail(status_w: RawFd) -> ! {
    let errno = *libc::__errno_location();
    let bytes = errno.to_ne_bytes();
    libc::write(
        status_w,
        bytes.as_ptr() as *const libc::c_void,
        bytes.len(),
    );
    libc::_exit(127)
}

unsafe fn write_proc_file(path: &std::ffi::CStr, data: &[u8]) -> bool {
    let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
    if fd < 0 {
        return false;
    }
    let n = libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
    libc::close(fd);
    n == data.len() as isize
}
