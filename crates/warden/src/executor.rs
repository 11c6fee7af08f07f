//! Event-driven stage executor
//!
//! Runs exactly one module: spawn the worker, wait on the shared multiplexer
//! for its message and its exit, enforce the stage deadline, escalate to
//! SIGKILL, reap the worker exactly once and fold everything into a
//! [`StageReport`]. Stage failures never escape as `Err`; they are the
//! report's outcome.

use crate::error::StageError;
use crate::identity::exit_code;
use crate::ipc::{Channel, Message};
use crate::registry::{ModuleEntry, ModuleId, Registry};
use crate::resources::{SharedResources, SIGNAL_TOKEN};
use crate::spawner;
use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of one stage: the success payload (if any) or why it failed.
pub type StageOutcome = Result<Option<Vec<u8>>, StageError>;

/// Timing policy for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Time a worker has to deliver its message
    pub ipc_timeout: Duration,
    /// Extra time to observe the exit, and the SIGKILL reap budget
    pub exit_timeout: Duration,
    /// Upper bound on one multiplexer wait before the child is polled
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            ipc_timeout: Duration::from_millis(2000),
            exit_timeout: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Everything observed about one stage.
#[derive(Debug)]
pub struct StageReport {
    pub module: ModuleId,
    /// Worker pid, if one was forked
    pub pid: Option<Pid>,
    /// How the worker ended, if its exit was collected
    pub exit: Option<WaitStatus>,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

impl StageReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The success payload as text, if any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match &self.outcome {
            Ok(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

/// Per-stage bookkeeping for the worker in flight.
struct RunningStage {
    pid: Pid,
    channel: Channel,
    registered: bool,
    outcome: Option<StageOutcome>,
    exit: Option<WaitStatus>,
    /// The child is gone but its status was collected elsewhere.
    lost: bool,
}

impl RunningStage {
    fn exited(&self) -> bool {
        self.exit.is_some() || self.lost
    }

    fn settle(&mut self, outcome: StageOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn deregister(&mut self, resources: &mut SharedResources) {
        if self.registered {
            resources.deregister(&self.channel);
            self.registered = false;
        }
    }

    /// Non-blocking reap of our own worker.
    fn poll_exit(&mut self) {
        if self.exited() {
            return;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                debug!("Worker {} exited: {:?}", self.pid, status);
                self.exit = Some(status);
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                warn!("Worker {} already reaped", self.pid);
                self.lost = true;
            }
            Err(e) => debug!("waitpid({}) failed: {}", self.pid, e),
        }
    }

    fn read_message(&mut self, resources: &mut SharedResources, flags: EpollFlags) {
        match self.channel.receive() {
            Ok(Some(msg)) => {
                self.settle(interpret(&msg));
                self.deregister(resources);
            }
            Ok(None) => {
                if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    self.deregister(resources);
                }
            }
            Err(e) => {
                self.settle(Err(StageError::ProtocolRecv(e)));
                self.deregister(resources);
            }
        }
    }
}

/// Translate a received message into a stage outcome.
fn interpret(msg: &Message) -> StageOutcome {
    if msg.is_success() {
        let data = msg.data();
        Ok((!data.is_empty()).then(|| data.to_vec()))
    } else {
        let detail = msg.text();
        Err(StageError::Module {
            code: msg.status_code(),
            detail: (!detail.is_empty()).then_some(detail),
        })
    }
}

/// Why a worker that exited without a message failed.
fn silent_exit(status: Option<WaitStatus>) -> StageError {
    match status {
        Some(WaitStatus::Exited(_, exit_code::SEND_FAILED)) => StageError::ProtocolSend,
        status => StageError::NoResponse { status },
    }
}

/// Run `module` with `arg` to completion on the shared resources.
///
/// The channel is always deregistered and closed before this returns, and
/// the worker has been reaped unless the report says [`StageError::Zombie`].
pub fn execute_stage<E: ModuleEntry>(
    resources: &mut SharedResources,
    registry: &Registry<E>,
    module: ModuleId,
    arg: Option<&str>,
    config: &ExecutorConfig,
) -> StageReport {
    let start = Instant::now();
    resources.sweep_stragglers();

    let Some(desc) = registry.get(module) else {
        return StageReport {
            module,
            pid: None,
            exit: None,
            outcome: Err(StageError::InvalidArgument(module)),
            elapsed: start.elapsed(),
        };
    };

    let worker = match spawner::spawn(desc, arg) {
        Ok(w) => w,
        Err(e) => {
            warn!("Failed to spawn {} worker: {}", module, e);
            return StageReport {
                module,
                pid: None,
                exit: None,
                outcome: Err(e.into()),
                elapsed: start.elapsed(),
            };
        }
    };

    let mut stage = RunningStage {
        pid: worker.pid,
        channel: worker.channel,
        registered: false,
        outcome: None,
        exit: None,
        lost: false,
    };

    match resources.register(&stage.channel) {
        Ok(()) => {
            stage.registered = true;
            await_worker(resources, &mut stage, start, config);
        }
        Err(e) => stage.settle(Err(StageError::Registration(e))),
    }

    finish(resources, stage, module, start, config, force_reap)
}

/// Event loop for one stage: message and exit, bounded by the stage deadline.
fn await_worker(
    resources: &mut SharedResources,
    stage: &mut RunningStage,
    start: Instant,
    config: &ExecutorConfig,
) {
    let deadline = start + config.ipc_timeout + config.exit_timeout;
    let channel_token = stage.channel.as_raw_fd() as u64;
    let mut events = [EpollEvent::empty(); 8];

    while !stage.exited() {
        let now = Instant::now();
        if now >= deadline {
            if stage.outcome.is_none() {
                warn!("Worker {} timed out", stage.pid);
                stage.settle(Err(StageError::Timeout));
            }
            break;
        }

        let slice = (deadline - now).min(config.poll_interval);
        match resources.wait(&mut events, slice) {
            Ok(n) => {
                for event in &events[..n] {
                    if event.data() == SIGNAL_TOKEN {
                        for pid in resources.drain_exits() {
                            if pid == stage.pid {
                                stage.poll_exit();
                            } else {
                                resources.reap_foreign(pid);
                            }
                        }
                    } else if event.data() == channel_token && stage.registered {
                        stage.read_message(resources, event.events());
                    }
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("epoll_wait failed: {}", e);
                stage.settle(Err(StageError::Wait(e)));
                break;
            }
        }

        // SIGCHLD coalesces and may be taken by another thread's notifier.
        stage.poll_exit();
    }
}

/// Settle the outcome, make sure the worker is gone and build the report.
///
/// `escalate` kills a worker that has not exited and returns its status, or
/// `None` when its death could not be confirmed within the budget.
fn finish(
    resources: &mut SharedResources,
    mut stage: RunningStage,
    module: ModuleId,
    start: Instant,
    config: &ExecutorConfig,
    escalate: impl FnOnce(Pid, Duration) -> Option<WaitStatus>,
) -> StageReport {
    if stage.exited() && stage.outcome.is_none() {
        // The datagram may race the exit notification.
        let outcome = match stage.channel.receive() {
            Ok(Some(msg)) => interpret(&msg),
            Ok(None) => Err(silent_exit(stage.exit)),
            Err(e) => Err(StageError::ProtocolRecv(e)),
        };
        stage.settle(outcome);
    }

    if !stage.exited() {
        match escalate(stage.pid, config.exit_timeout) {
            Some(status) => stage.exit = Some(status),
            None => {
                error!(
                    "{} worker {} survived SIGKILL; recording as straggler",
                    module, stage.pid
                );
                resources.record_straggler(stage.pid);
                if matches!(stage.outcome, None | Some(Ok(_))) {
                    stage.outcome = Some(Err(StageError::Zombie));
                }
            }
        }
    }

    stage.deregister(resources);
    let outcome = stage
        .outcome
        .take()
        .unwrap_or_else(|| Err(silent_exit(stage.exit)));

    let elapsed = start.elapsed();
    match &outcome {
        Ok(_) => info!("{} completed in {:?}", module, elapsed),
        Err(e) => info!("{} failed after {:?}: {}", module, elapsed, e),
    }

    StageReport {
        module,
        pid: Some(stage.pid),
        exit: stage.exit,
        outcome,
        elapsed,
    }
}

/// SIGKILL the worker and poll for its exit for up to `budget`.
///
/// Returns `None` when death could not be confirmed.
fn force_reap(pid: Pid, budget: Duration) -> Option<WaitStatus> {
    debug!("Killing worker {}", pid);
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        debug!("kill({}) failed: {}", pid, e);
    }

    let deadline = Instant::now() + budget;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(status) => return Some(status),
            Err(Errno::ECHILD) => {
                warn!("Worker {} already reaped", pid);
                return Some(WaitStatus::Signaled(pid, Signal::SIGKILL, false));
            }
            Err(e) => debug!("waitpid({}) failed: {}", pid, e),
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::registry::{Identity, ModuleDescriptor};
    use nix::unistd;
    use std::num::NonZeroI32;

    /// Worker behaviors used to drive the executor.
    enum TestBody {
        LoseReply,
        Reply(&'static str),
        Echo,
        Fail(i32, &'static str),
        Hang,
        ReplyThenHang(&'static str),
        ExitSilently,
        Garbage,
    }

    impl ModuleEntry for TestBody {
        fn run(&self, channel: &Channel, arg: Option<&str>) -> Result<(), ProtocolError> {
            let mut msg = Message::new();
            match self {
                TestBody::LoseReply => {
                    return Err(ProtocolError::ShortWrite {
                        written: 0,
                        expected: crate::ipc::MESSAGE_SIZE,
                    });
                }
                TestBody::Reply(text) => {
                    msg.set_data(Some(text.as_bytes()));
                }
                TestBody::Echo => {
                    msg.set_data(arg.map(str::as_bytes));
                }
                TestBody::Fail(code, detail) => {
                    msg.set_error(NonZeroI32::new(*code).unwrap(), Some(detail));
                }
                TestBody::Hang => loop {
                    std::thread::sleep(Duration::from_secs(60));
                },
                TestBody::ReplyThenHang(text) => {
                    msg.set_data(Some(text.as_bytes()));
                    channel.send(&msg)?;
                    loop {
                        std::thread::sleep(Duration::from_secs(60));
                    }
                }
                TestBody::ExitSilently => return Ok(()),
                TestBody::Garbage => {
                    let junk = b"not a message";
                    // SAFETY: valid fd and buffer for the duration of the call.
                    unsafe {
                        libc::send(channel.as_raw_fd(), junk.as_ptr().cast(), junk.len(), 0)
                    };
                    return Ok(());
                }
            }
            channel.send(&msg)
        }
    }

    fn me() -> Identity {
        Identity {
            uid: unistd::getuid().as_raw(),
            gid: unistd::getgid().as_raw(),
            label: None,
        }
    }

    fn registry() -> Registry<TestBody> {
        Registry::new([
            ModuleDescriptor::new(ModuleId::Imei, me(), TestBody::Reply("356938035643809")),
            ModuleDescriptor::new(ModuleId::Phone, me(), TestBody::Echo),
            ModuleDescriptor::new(ModuleId::Mac, me(), TestBody::Fail(17, "no such iface")),
            ModuleDescriptor::new(ModuleId::Logger, me(), TestBody::Hang),
            ModuleDescriptor::new(ModuleId::Sender, me(), TestBody::ExitSilently),
            ModuleDescriptor::new(ModuleId::DbCleaner, me(), TestBody::Garbage),
        ])
        .expect("registry")
    }

    fn fast() -> ExecutorConfig {
        ExecutorConfig {
            ipc_timeout: Duration::from_millis(300),
            exit_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn assert_reaped(report: &StageReport) {
        let pid = report.pid.expect("worker was forked");
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_successful_stage_returns_payload_and_reaps_once() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(
            &mut resources,
            &registry(),
            ModuleId::Imei,
            None,
            &ExecutorConfig::default(),
        );

        assert_eq!(report.text().as_deref(), Some("356938035643809"));
        assert!(matches!(report.exit, Some(WaitStatus::Exited(_, 0))));
        assert_reaped(&report);
        assert_eq!(resources.active_registrations(), 0);
    }

    #[test]
    fn test_argument_reaches_worker() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(
            &mut resources,
            &registry(),
            ModuleId::Phone,
            Some("IMEI:1|PHONE:N/A|MAC:N/A|DB:0"),
            &fast(),
        );
        assert_eq!(
            report.text().as_deref(),
            Some("IMEI:1|PHONE:N/A|MAC:N/A|DB:0")
        );
    }

    #[test]
    fn test_empty_success_payload_is_none() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(&mut resources, &registry(), ModuleId::Phone, None, &fast());
        assert!(matches!(report.outcome, Ok(None)));
    }

    #[test]
    fn test_module_failure_carries_code_and_detail() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(&mut resources, &registry(), ModuleId::Mac, None, &fast());
        match &report.outcome {
            Err(StageError::Module { code, detail }) => {
                assert_eq!(*code, 17);
                assert_eq!(detail.as_deref(), Some("no such iface"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_reaped(&report);
    }

    #[test]
    fn test_hanging_worker_times_out_and_is_killed() {
        let mut resources = SharedResources::new().unwrap();
        let config = fast();
        let report = execute_stage(&mut resources, &registry(), ModuleId::Logger, None, &config);

        assert!(matches!(report.outcome, Err(StageError::Timeout)));
        assert!(matches!(
            report.exit,
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));
        assert!(report.elapsed >= config.ipc_timeout + config.exit_timeout);
        assert_reaped(&report);
        assert_eq!(resources.straggler_count(), 0);
    }

    #[test]
    fn test_reply_without_exit_keeps_success_after_kill() {
        let mut resources = SharedResources::new().unwrap();
        let lingering = Registry::new([ModuleDescriptor::new(
            ModuleId::Imei,
            me(),
            TestBody::ReplyThenHang("v"),
        )])
        .unwrap();
        let config = fast();
        let report = execute_stage(&mut resources, &lingering, ModuleId::Imei, None, &config);

        assert!(matches!(&report.outcome, Ok(Some(data)) if data.as_slice() == b"v"));
        assert!(matches!(
            report.exit,
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));
        assert!(report.elapsed >= config.ipc_timeout + config.exit_timeout);
        assert_reaped(&report);
        assert_eq!(resources.active_registrations(), 0);
        assert_eq!(resources.straggler_count(), 0);
    }

    #[test]
    fn test_registration_failure_still_reaps_worker() {
        let mut resources = SharedResources::new().unwrap();
        resources.fail_next_registration(Errno::ENOSPC);
        let report = execute_stage(&mut resources, &registry(), ModuleId::Imei, None, &fast());

        assert!(matches!(
            report.outcome,
            Err(StageError::Registration(Errno::ENOSPC))
        ));
        assert!(report.exit.is_some());
        assert_reaped(&report);
        assert_eq!(resources.active_registrations(), 0);
    }

    #[test]
    fn test_unconfirmed_kill_becomes_zombie_and_straggler() {
        let mut resources = SharedResources::new().unwrap();
        let desc = ModuleDescriptor::new(ModuleId::Imei, me(), TestBody::ReplyThenHang("v"));
        let worker = spawner::spawn(&desc, None).unwrap();
        let pid = worker.pid;
        let mut stage = RunningStage {
            pid,
            channel: worker.channel,
            registered: false,
            outcome: None,
            exit: None,
            lost: false,
        };
        stage.settle(Ok(Some(b"v".to_vec())));

        let report = finish(
            &mut resources,
            stage,
            ModuleId::Imei,
            Instant::now(),
            &fast(),
            |_, _| None,
        );

        assert!(matches!(report.outcome, Err(StageError::Zombie)));
        assert!(report.exit.is_none());
        assert!(resources.is_straggler(pid));

        // Once it really dies, the next stage's sweep collects it.
        signal::kill(pid, Signal::SIGKILL).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while resources.is_straggler(pid) && Instant::now() < deadline {
            resources.sweep_stragglers();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(resources.straggler_count(), 0);
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_silent_exit_is_not_success() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(&mut resources, &registry(), ModuleId::Sender, None, &fast());
        match &report.outcome {
            Err(StageError::NoResponse { status }) => {
                assert!(matches!(status, Some(WaitStatus::Exited(_, 0))));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_reaped(&report);
    }

    #[test]
    fn test_lost_reply_is_send_failure() {
        let mut resources = SharedResources::new().unwrap();
        let lossy = Registry::new([ModuleDescriptor::new(
            ModuleId::Imei,
            me(),
            TestBody::LoseReply,
        )])
        .unwrap();
        let report = execute_stage(&mut resources, &lossy, ModuleId::Imei, None, &fast());

        assert!(matches!(report.outcome, Err(StageError::ProtocolSend)));
        assert!(matches!(
            report.exit,
            Some(WaitStatus::Exited(_, exit_code::SEND_FAILED))
        ));
        assert_reaped(&report);
    }

    #[test]
    fn test_silent_exit_keeps_other_statuses() {
        let pid = Pid::from_raw(1);
        assert!(matches!(
            silent_exit(Some(WaitStatus::Exited(pid, exit_code::SEND_FAILED))),
            StageError::ProtocolSend
        ));
        assert!(matches!(
            silent_exit(Some(WaitStatus::Exited(pid, exit_code::UID))),
            StageError::NoResponse { .. }
        ));
        assert!(matches!(
            silent_exit(None),
            StageError::NoResponse { status: None }
        ));
    }

    #[test]
    fn test_malformed_datagram_is_protocol_failure() {
        let mut resources = SharedResources::new().unwrap();
        let report = execute_stage(
            &mut resources,
            &registry(),
            ModuleId::DbCleaner,
            None,
            &fast(),
        );
        assert!(matches!(report.outcome, Err(StageError::ProtocolRecv(_))));
        assert_reaped(&report);
    }

    #[test]
    fn test_unregistered_module_is_invalid_argument() {
        let mut resources = SharedResources::new().unwrap();
        let sparse = Registry::new([ModuleDescriptor::new(ModuleId::Imei, me(), TestBody::Echo)])
            .unwrap();
        let report = execute_stage(&mut resources, &sparse, ModuleId::Sender, None, &fast());
        assert!(matches!(
            report.outcome,
            Err(StageError::InvalidArgument(ModuleId::Sender))
        ));
        assert!(report.pid.is_none());
    }

    #[test]
    fn test_no_registrations_leak_across_stages() {
        let mut resources = SharedResources::new().unwrap();
        let registry = registry();
        for module in [
            ModuleId::Imei,
            ModuleId::Mac,
            ModuleId::Sender,
            ModuleId::DbCleaner,
            ModuleId::Imei,
        ] {
            let report = execute_stage(&mut resources, &registry, module, None, &fast());
            assert_reaped(&report);
            assert_eq!(resources.active_registrations(), 0);
        }
    }
}
