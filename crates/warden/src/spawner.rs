//! Worker process spawning
//!
//! [`spawn`] creates a private channel, forks, and in the child assumes the
//! module's identity before running its entry behavior. The worker never
//! `exec`s: the module body runs in the forked image and leaves through
//! `_exit`, so no parent destructors or atexit handlers run in the child.
//!
//! # Fork safety
//!
//! The child allocates (module bodies are ordinary Rust code). That is only
//! sound when the supervisor is single-threaded at fork time, which the
//! daemon checks at start-up (see [`thread_count`]).

use crate::error::SpawnError;
use crate::identity::{self, exit_code};
use crate::ipc::Channel;
use crate::registry::{ModuleDescriptor, ModuleEntry};
use nix::sys::prctl;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::unistd::{self, fork, ForkResult, Pid};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

/// A freshly forked worker as seen by the supervisor.
pub struct SpawnedWorker {
    /// Worker process id
    pub pid: Pid,
    /// Supervisor end of the worker channel (non-blocking)
    pub channel: Channel,
}

/// Fork a worker for `desc` and hand it `arg`.
///
/// Only channel and fork failures are reported here. A failure to assume the
/// identity happens in the child and is only observable as the child exiting
/// without having sent a message.
pub fn spawn<E: ModuleEntry>(
    desc: &ModuleDescriptor<E>,
    arg: Option<&str>,
) -> Result<SpawnedWorker, SpawnError> {
    let (supervisor_end, worker_end) = Channel::pair().map_err(SpawnError::Channel)?;

    // Computed before fork: reading /proc allocates.
    let supervisor_pid = unistd::getpid();
    let highest_fd = highest_inherited_fd();

    // SAFETY: the supervisor is single-threaded (checked at start-up), so the
    // child inherits a consistent heap and may allocate.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(supervisor_end);
            let code = run_worker(desc, &worker_end, arg, supervisor_pid, highest_fd);
            // SAFETY: _exit is async-signal-safe and skips parent-owned cleanup.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(worker_end);
            debug!("Spawned {} worker as pid {}", desc.name(), child);
            Ok(SpawnedWorker {
                pid: child,
                channel: supervisor_end,
            })
        }
        Err(e) => Err(SpawnError::Fork(e)),
    }
}

/// Child side of [`spawn`]. Returns the exit code for `_exit`.
fn run_worker<E: ModuleEntry>(
    desc: &ModuleDescriptor<E>,
    channel: &Channel,
    arg: Option<&str>,
    supervisor_pid: Pid,
    highest_fd: RawFd,
) -> i32 {
    reset_signal_state();

    // Die with the supervisor. Checking the parent afterwards closes the race
    // where it exited before the death signal was armed.
    if prctl::set_pdeathsig(Signal::SIGKILL).is_err() || unistd::getppid() != supervisor_pid {
        return exit_code::PARENT_GONE;
    }

    close_inherited_fds(highest_fd, channel.as_raw_fd());

    if let Err(failure) = identity::assume(&desc.identity) {
        return failure.exit_code();
    }

    match panic::catch_unwind(AssertUnwindSafe(|| desc.entry.run(channel, arg))) {
        Ok(Ok(())) => 0,
        Ok(Err(_)) => exit_code::SEND_FAILED,
        Err(_) => exit_code::PANIC,
    }
}

/// Start the worker from a clean signal state: nothing blocked, default
/// dispositions for the signals the supervisor runtime touches.
fn reset_signal_state() {
    let _ = SigSet::empty().thread_set_mask();
    for sig in [Signal::SIGCHLD, Signal::SIGPIPE] {
        // SAFETY: restoring the default disposition installs no handler.
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }
}

/// Close every descriptor above stderr except `keep`.
///
/// `highest` comes from the parent: listing `/proc` allocates.
fn close_inherited_fds(highest: RawFd, keep: RawFd) {
    (libc::STDERR_FILENO + 1..=highest)
        .filter(|&fd| fd != keep)
        .for_each(|fd| {
            // SAFETY: the child leaves through _exit and never drops the
            // parent's handles, so nothing else closes these numbers.
            unsafe { libc::close(fd) };
        });
}

/// Largest descriptor number a worker can inherit.
fn highest_inherited_fd() -> RawFd {
    const FALLBACK: RawFd = 1024;
    const CEILING: libc::c_long = 65536;

    let listed = std::fs::read_dir("/proc/self/fd").ok().and_then(|dir| {
        dir.flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<RawFd>().ok())
            .max()
    });
    listed.unwrap_or_else(|| {
        // SAFETY: sysconf only reads a limit.
        match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
            limit if limit > 0 => limit.min(CEILING) as RawFd,
            _ => FALLBACK,
        }
    })
}

/// Current number of threads in this process, from `/proc/self/status`.
pub fn thread_count() -> std::io::Result<usize> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse::<usize>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Threads: line missing from /proc/self/status",
            )
        })
}
