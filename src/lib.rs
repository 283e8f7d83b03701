//! Kernel-behavior verification harness.
//!
//! Test cases use two protocols built on a checked syscall layer:
//! the [`sync`] process synchronizer (spawn, wait for a scheduling state,
//! signal, reap) and the [`probe`] fault-recovery probe (run a memory
//! access that may fault and get a tagged outcome back).

pub mod cases;
pub mod failure;
pub mod platform;
pub mod probe;
pub mod report;
pub mod safe_call;
pub mod sync;

pub use failure::{assert_expr, Failure, FailureKind, Result, SafeCall};
pub use probe::{FaultProbe, ProbeOutcome};
pub use report::{Reporter, ResultKind};
pub use sync::{ProcessHandle, SyncConfig, SyncOutcome, Synchronizer};
