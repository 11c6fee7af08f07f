//! Shared multiplexing resources
//!
//! One epoll instance and one signalfd for SIGCHLD, created once at start-up
//! and lent mutably to each stage in turn. SIGCHLD stays blocked in the
//! owning thread for as long as the bundle lives, so child exits are only
//! ever observed through the signalfd; the previous mask is restored on drop.

use crate::error::{Result, WardenError};
use crate::ipc::Channel;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Epoll token of the signalfd. Channel registrations use their raw fd,
/// which can never take this value.
pub const SIGNAL_TOKEN: u64 = u64::MAX;

/// The multiplexer, exit notifier and bookkeeping shared by every stage.
pub struct SharedResources {
    epoll: Epoll,
    signals: SignalFd,
    saved_mask: SigSet,
    stragglers: BTreeSet<Pid>,
    active_registrations: usize,
    #[cfg(test)]
    registration_failure: Option<Errno>,
}

impl SharedResources {
    /// Block SIGCHLD in the calling thread and create the multiplexer and
    /// the exit notifier.
    pub fn new() -> Result<Self> {
        let mut chld = SigSet::empty();
        chld.add(Signal::SIGCHLD);
        let saved_mask = chld
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(WardenError::ExitNotifier)?;

        match Self::open(&chld) {
            Ok((epoll, signals)) => {
                debug!("Shared resources ready (SIGCHLD routed to signalfd)");
                Ok(SharedResources {
                    epoll,
                    signals,
                    saved_mask,
                    stragglers: BTreeSet::new(),
                    active_registrations: 0,
                    #[cfg(test)]
                    registration_failure: None,
                })
            }
            Err(e) => {
                let _ = saved_mask.thread_set_mask();
                Err(e)
            }
        }
    }

    fn open(chld: &SigSet) -> Result<(Epoll, SignalFd)> {
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(WardenError::Multiplexer)?;
        let signals = SignalFd::with_flags(chld, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(WardenError::ExitNotifier)?;
        epoll
            .add(&signals, EpollEvent::new(EpollFlags::EPOLLIN, SIGNAL_TOKEN))
            .map_err(WardenError::Multiplexer)?;
        Ok((epoll, signals))
    }

    /// Watch `channel` for readability. The event carries the channel's raw fd.
    pub fn register(&mut self, channel: &Channel) -> std::result::Result<(), Errno> {
        if let Some(errno) = self.injected_registration_failure() {
            return Err(errno);
        }
        let token = channel.as_raw_fd() as u64;
        self.epoll
            .add(channel, EpollEvent::new(EpollFlags::EPOLLIN, token))?;
        self.active_registrations += 1;
        Ok(())
    }

    /// Make the next [`register`](Self::register) call fail with `errno`.
    #[cfg(test)]
    pub(crate) fn fail_next_registration(&mut self, errno: Errno) {
        self.registration_failure = Some(errno);
    }

    #[cfg(test)]
    fn injected_registration_failure(&mut self) -> Option<Errno> {
        self.registration_failure.take()
    }

    #[cfg(not(test))]
    fn injected_registration_failure(&mut self) -> Option<Errno> {
        None
    }

    /// Stop watching `channel`.
    ///
    /// The count drops even if the kernel call fails: the caller closes the
    /// channel right after, which removes it from the epoll set anyway.
    pub fn deregister(&mut self, channel: &Channel) {
        if let Err(e) = self.epoll.delete(channel) {
            debug!("epoll delete failed for fd {}: {}", channel.as_raw_fd(), e);
        }
        self.active_registrations = self.active_registrations.saturating_sub(1);
    }

    /// Number of channels currently registered. Zero between stages.
    #[must_use]
    pub fn active_registrations(&self) -> usize {
        self.active_registrations
    }

    /// Wait for readiness for at most `timeout`.
    pub fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: Duration,
    ) -> std::result::Result<usize, Errno> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        self.epoll.wait(events, EpollTimeout::from(ms))
    }

    /// Read every queued exit record and return the reporting pids.
    ///
    /// SIGCHLD is not queued: one record may stand for several exits, so
    /// callers must still poll the children they care about.
    pub fn drain_exits(&mut self) -> Vec<Pid> {
        let mut pids = Vec::new();
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => pids.push(Pid::from_raw(info.ssi_pid as i32)),
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Failed to read exit notification: {}", e);
                    break;
                }
            }
        }
        pids
    }

    /// Remember a worker whose death could not be confirmed.
    pub fn record_straggler(&mut self, pid: Pid) {
        self.stragglers.insert(pid);
    }

    #[must_use]
    pub fn is_straggler(&self, pid: Pid) -> bool {
        self.stragglers.contains(&pid)
    }

    #[must_use]
    pub fn straggler_count(&self) -> usize {
        self.stragglers.len()
    }

    /// Handle an exit record for a pid that is not the current stage's worker.
    ///
    /// Only known stragglers are reaped; any other pid belongs to someone else.
    pub fn reap_foreign(&mut self, pid: Pid) {
        if self.is_straggler(pid) {
            self.try_reap_straggler(pid);
        } else {
            debug!("Ignoring exit notification for unknown pid {}", pid);
        }
    }

    /// Non-blocking reap attempt on every known straggler.
    pub fn sweep_stragglers(&mut self) {
        let pending: Vec<Pid> = self.stragglers.iter().copied().collect();
        for pid in pending {
            self.try_reap_straggler(pid);
        }
    }

    fn try_reap_straggler(&mut self, pid: Pid) {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                info!("Reaped straggler {}: {:?}", pid, status);
                self.stragglers.remove(&pid);
            }
            Err(Errno::ECHILD) => {
                self.stragglers.remove(&pid);
            }
            Err(e) => debug!("waitpid({}) failed for straggler: {}", pid, e),
        }
    }
}

impl Drop for SharedResources {
    fn drop(&mut self) {
        if self.active_registrations != 0 {
            warn!(
                "Releasing shared resources with {} active registrations",
                self.active_registrations
            );
        }
        // Exit records still queued belong to children nobody will reap now.
        let _ = self.drain_exits();
        if let Err(e) = self.saved_mask.thread_set_mask() {
            warn!("Failed to restore signal mask: {}", e);
        }
    }
}

impl std::fmt::Debug for SharedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResources")
            .field("active_registrations", &self.active_registrations)
            .field("stragglers", &self.stragglers)
            .finish_non_exhaustive()
    }
}
