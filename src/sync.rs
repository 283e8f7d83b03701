use crate::failure::{Failure, Result};
use crate::safe_call;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Child exit code: the expected path was reached.
pub const CHILD_SUCCESS: i32 = 0;
/// Child exit code: the child observed a contract violation.
pub const CHILD_VIOLATION: i32 = 1;
/// Child exit code: a safe call failed inside the child, or it panicked.
pub const CHILD_BROKEN: i32 = 2;

/// Maps a child body's own check to its exit code.
pub fn exit_code(verdict: Result<bool>) -> i32 {
    match verdict {
        Ok(true) => CHILD_SUCCESS,
        Ok(false) => CHILD_VIOLATION,
        Err(_) => CHILD_BROKEN,
    }
}

/// How a synchronization cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The child exited with this status
    Exited(i32),
    /// The child was terminated by this signal
    SignaledBy(Signal),
    /// The child never reached the target scheduling state
    TimedOut,
}

/// Configuration for one synchronization cycle
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scheduling state to wait for, as printed in `/proc/<pid>/stat`
    pub target_state: char,
    /// Deadline for reaching the target state
    pub timeout: Duration,
    /// Delay between two state polls
    pub poll_interval: Duration,
    /// Signal delivered once the state is reached
    pub signal: Signal,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_state: 'S',
            timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(10),
            signal: Signal::SIGINT,
        }
    }
}

/// A forked child owned by the synchronizer until it is reaped.
///
/// Dropping a handle that was never reaped kills and reaps the child so
/// an aborted test body does not leave it behind.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    reaped: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!("child {} dropped before being reaped, killing it", self.pid);
        match nix::sys::signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("kill({}, SIGKILL) failed: {}", self.pid, e),
        }
        if let Err(e) = safe_call::waitpid(self.pid, None) {
            warn!("{}", e.detail());
        }
    }
}

/// Extracts the state letter from the contents of `/proc/<pid>/stat`.
///
/// The command name may itself contain spaces and parentheses, so the
/// state is the first field after the last `)`.
pub fn parse_stat_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Reads the scheduling state of `pid`; `None` once the process is gone.
pub fn read_state(pid: Pid) -> Result<Option<char>> {
    let path = PathBuf::from(format!("/proc/{pid}/stat"));
    match std::fs::read_to_string(&path) {
        Ok(stat) => parse_stat_state(&stat)
            .map(Some)
            .ok_or_else(|| Failure::broken(format!("malformed {}: {stat:?}", path.display()))),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) || e.raw_os_error() == Some(libc::ESRCH) => {
            Ok(None)
        }
        Err(e) => Err(Failure::broken(format!("read({})", path.display())).with_source(e)),
    }
}

fn is_dead_state(state: char) -> bool {
    matches!(state, 'Z' | 'X' | 'x')
}

fn classify(status: WaitStatus) -> Result<SyncOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Ok(SyncOutcome::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(SyncOutcome::SignaledBy(signal)),
        other => Err(Failure::broken(format!("unexpected wait status {other:?}"))),
    }
}

/// Drives one child through spawn, state wait, signal and reap.
pub struct Synchronizer {
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Forks; the child runs `child_body` and `_exit`s with its return value.
    ///
    /// The child never returns into the caller. A panic inside the body
    /// ends the child with [`CHILD_BROKEN`]. The body runs in a forked
    /// copy of a possibly multi-threaded process: it should stick to raw
    /// syscalls and must not log.
    pub fn spawn<F>(&self, child_body: F) -> Result<ProcessHandle>
    where
        F: FnOnce() -> i32,
    {
        match unsafe { safe_call::fork()? } {
            ForkResult::Child => {
                let code = panic::catch_unwind(AssertUnwindSafe(child_body)).unwrap_or(CHILD_BROKEN);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                debug!("spawned child {}", child);
                Ok(ProcessHandle {
                    pid: child,
                    reaped: false,
                })
            }
        }
    }

    /// Polls the child's scheduling state until it equals `target` or
    /// `timeout` elapses.
    ///
    /// Returns `false` as soon as the child is found dead, without waiting
    /// out the deadline.
    pub async fn wait_for_state(
        &self,
        handle: &ProcessHandle,
        target: char,
        timeout: Duration,
    ) -> Result<bool> {
        if handle.reaped {
            return Err(Failure::broken(format!(
                "child {} already reaped, cannot poll its state",
                handle.pid
            )));
        }

        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            match read_state(handle.pid)? {
                Some(state) if state == target => {
                    debug!(
                        "child {} reached state {} after {:?}",
                        handle.pid,
                        state,
                        start.elapsed()
                    );
                    return Ok(true);
                }
                Some(state) if is_dead_state(state) => {
                    info!("child {} terminated before reaching state {}", handle.pid, target);
                    return Ok(false);
                }
                None => {
                    info!("child {} vanished before reaching state {}", handle.pid, target);
                    return Ok(false);
                }
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "child {} did not reach state {} within {:?}",
                    handle.pid, target, timeout
                );
                return Ok(false);
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Sends `signal` and blocks until the child terminates.
    pub async fn signal_and_reap(
        &self,
        handle: &mut ProcessHandle,
        signal: Signal,
    ) -> Result<SyncOutcome> {
        if handle.reaped {
            return Err(Failure::broken(format!(
                "child {} already reaped, cannot signal it",
                handle.pid
            )));
        }
        debug!("sending {} to child {}", signal, handle.pid);
        safe_call::kill(handle.pid, signal)?;
        self.reap(handle).await
    }

    /// Blocks until the child terminates on its own.
    pub async fn reap(&self, handle: &mut ProcessHandle) -> Result<SyncOutcome> {
        if handle.reaped {
            return Err(Failure::broken(format!(
                "child {} already reaped",
                handle.pid
            )));
        }
        let pid = handle.pid;
        let status = tokio::task::spawn_blocking(move || safe_call::waitpid(pid, None))
            .await
            .map_err(|e| Failure::broken(format!("reaper for child {pid} failed: {e}")))?;
        handle.reaped = true;

        let outcome = classify(status?)?;
        info!("child {} reaped: {:?}", pid, outcome);
        Ok(outcome)
    }

    /// Full cycle with the configured target state, timeout and signal.
    ///
    /// A child that terminated on its own before reaching the target state
    /// is reaped and its real outcome returned, so the caller can tell why
    /// it never blocked. When a live child never reaches the state it is
    /// killed and reaped for cleanup and the cycle ends in
    /// [`SyncOutcome::TimedOut`].
    pub async fn synchronize(&self, mut handle: ProcessHandle) -> Result<SyncOutcome> {
        let config = &self.config;
        if self
            .wait_for_state(&handle, config.target_state, config.timeout)
            .await?
        {
            return self.signal_and_reap(&mut handle, config.signal).await;
        }

        match read_state(handle.pid)? {
            Some(state) if !is_dead_state(state) => {}
            _ => return self.reap(&mut handle).await,
        }

        let leftover = self.signal_and_reap(&mut handle, Signal::SIGKILL).await?;
        warn!(
            "child {} never reached state {}, cleaned up with {:?}",
            handle.pid, config.target_state, leftover
        );
        Ok(SyncOutcome::TimedOut)
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}
