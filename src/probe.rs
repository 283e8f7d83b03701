//! Fault-recovery probe.
//!
//! A probe runs a memory operation that may legitimately fault and turns
//! the result into a [`ProbeOutcome`] instead of a crashed process. While
//! a [`ProbeScope`] is active a recording handler is installed for every
//! watched signal. The operation itself runs in a forked probe child that
//! shares the caller's mappings: a fault enters the handler, which stores
//! the signal number in a shared slot and ends the child on the spot, so
//! nothing after the faulting access runs and the caller's stack is never
//! unwound through a signal frame.

use crate::failure::{Failure, Result, SafeCall};
use crate::safe_call::{self, HandlerGuard, SharedPage};
use crate::sync::{CHILD_BROKEN, CHILD_SUCCESS, CHILD_VIOLATION};
use nix::sys::signal::{SaFlags, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::ForkResult;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};
use tracing::debug;

/// Exit code of a probe child that took a watched fault.
const PROBE_FAULTED: i32 = 3;

/// The one slot the signal handler may write to.
///
/// Non-null exactly while a [`ProbeScope`] is active.
static ACTIVE_SLOT: AtomicPtr<ProbeSlot> = AtomicPtr::new(ptr::null_mut());

/// Set only in the address space of the forked child.
static IN_FAULT_CHILD: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default)]
struct ProbeSlot {
    /// Signal number recorded by the handler, 0 when none
    signal: AtomicI32,
}

extern "C" fn record_fault(signo: libc::c_int) {
    if !IN_FAULT_CHILD.load(Ordering::SeqCst) {
        // A fault of the caller itself: die of it as if no handler were set
        unsafe {
            libc::signal(signo, libc::SIG_DFL);
            libc::raise(signo);
        }
        return;
    }
    let slot = ACTIVE_SLOT.load(Ordering::SeqCst);
    if !slot.is_null() {
        unsafe { (*slot).signal.store(signo, Ordering::SeqCst) };
    }
    unsafe { libc::_exit(PROBE_FAULTED) }
}

/// Result of one probe activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The operation ran to the end and returned `held`
    Completed { held: bool },
    /// A watched signal the caller allows interrupted the operation
    FaultedExpected(Signal),
    /// A watched signal the caller does not allow interrupted the operation
    FaultedUnexpected(Signal),
}

impl ProbeOutcome {
    pub fn is_fault(&self) -> bool {
        !matches!(self, ProbeOutcome::Completed { .. })
    }

    pub fn signal(&self) -> Option<Signal> {
        match self {
            ProbeOutcome::Completed { .. } => None,
            ProbeOutcome::FaultedExpected(signal) | ProbeOutcome::FaultedUnexpected(signal) => {
                Some(*signal)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Armed,
    Completed,
    Faulted(Signal),
}

/// Activation record of one probe.
///
/// Holds the handlers it replaced and restores them on every exit path,
/// then releases the process-wide slot.
pub struct ProbeScope {
    slot: SharedPage<ProbeSlot>,
    handlers: Vec<HandlerGuard>,
    state: ProbeState,
}

impl ProbeScope {
    fn arm(watched: &[Signal]) -> Result<Self> {
        let slot = SharedPage::<ProbeSlot>::new()?;
        let slot_ptr = &*slot as *const ProbeSlot as *mut ProbeSlot;
        ACTIVE_SLOT
            .compare_exchange(ptr::null_mut(), slot_ptr, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Failure::broken("a fault probe is already active in this process"))?;

        let mut scope = Self {
            slot,
            handlers: Vec::with_capacity(watched.len()),
            state: ProbeState::Armed,
        };
        for &signal in watched {
            scope.handlers.push(HandlerGuard::install(
                signal,
                SigHandler::Handler(record_fault),
                SaFlags::empty(),
            )?);
        }
        scope.slot.signal.store(0, Ordering::SeqCst);
        debug!("probe armed for {:?}", watched);
        Ok(scope)
    }

    fn settle(&mut self, status: WaitStatus, expected: &[Signal]) -> Result<ProbeOutcome> {
        let recorded = self.slot.signal.load(Ordering::SeqCst);
        match status {
            WaitStatus::Exited(_, PROBE_FAULTED) if recorded != 0 => {
                let signal = Signal::try_from(recorded)
                    .safe(format_args!("decode recorded signal {recorded}"))?;
                self.state = ProbeState::Faulted(signal);
                if expected.contains(&signal) {
                    Ok(ProbeOutcome::FaultedExpected(signal))
                } else {
                    Ok(ProbeOutcome::FaultedUnexpected(signal))
                }
            }
            WaitStatus::Exited(_, code @ (CHILD_SUCCESS | CHILD_VIOLATION)) => {
                self.state = ProbeState::Completed;
                Ok(ProbeOutcome::Completed {
                    held: code == CHILD_SUCCESS,
                })
            }
            WaitStatus::Exited(_, CHILD_BROKEN) => {
                Err(Failure::broken("probed operation panicked"))
            }
            WaitStatus::Signaled(_, signal, _) => Err(Failure::broken(format!(
                "received an unexpected signal: {signal}"
            ))),
            other => Err(Failure::broken(format!(
                "unexpected probe child status {other:?}"
            ))),
        }
    }
}

impl Drop for ProbeScope {
    fn drop(&mut self) {
        while let Some(guard) = self.handlers.pop() {
            drop(guard);
        }
        ACTIVE_SLOT.store(ptr::null_mut(), Ordering::SeqCst);
        debug!("probe disarmed after {:?}", self.state);
    }
}

/// Runs memory operations that may raise a protection fault.
#[derive(Debug, Clone)]
pub struct FaultProbe {
    watched: Vec<Signal>,
    expected: Vec<Signal>,
}

impl Default for FaultProbe {
    fn default() -> Self {
        Self {
            watched: vec![Signal::SIGSEGV, Signal::SIGBUS],
            expected: vec![Signal::SIGSEGV],
        }
    }
}

impl FaultProbe {
    /// Watches SIGSEGV and SIGBUS, expects SIGSEGV.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set of signals recorded as faults.
    pub fn watching(mut self, signals: &[Signal]) -> Self {
        self.watched = signals.to_vec();
        self.watch_expected();
        self
    }

    /// Replaces the set of faults reported as expected.
    pub fn expecting(mut self, signals: &[Signal]) -> Self {
        self.expected = signals.to_vec();
        self.watch_expected();
        self
    }

    fn watch_expected(&mut self) {
        for signal in &self.expected {
            if !self.watched.contains(signal) {
                self.watched.push(*signal);
            }
        }
    }

    pub fn watched(&self) -> &[Signal] {
        &self.watched
    }

    pub fn expected(&self) -> &[Signal] {
        &self.expected
    }

    /// Runs `op` once under a fresh probe scope.
    ///
    /// `op` returns its own check (for instance whether the bytes it read
    /// matched), reported as `Completed { held }`. A watched fault cuts
    /// `op` short at the faulting access. Any other signal, or a second
    /// probe activated while this one is live, is Broken.
    pub fn with_probe<F>(&self, op: F) -> Result<ProbeOutcome>
    where
        F: FnOnce() -> bool,
    {
        let mut scope = ProbeScope::arm(&self.watched)?;

        let child = match unsafe { safe_call::fork()? } {
            ForkResult::Child => {
                IN_FAULT_CHILD.store(true, Ordering::SeqCst);
                let code = panic::catch_unwind(AssertUnwindSafe(op))
                    .map(|held| if held { CHILD_SUCCESS } else { CHILD_VIOLATION })
                    .unwrap_or(CHILD_BROKEN);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => child,
        };

        let status = safe_call::waitpid(child, None)?;
        let outcome = scope.settle(status, &self.expected)?;
        debug!("probe child {} settled as {:?}", child, outcome);
        Ok(outcome)
    }
}
