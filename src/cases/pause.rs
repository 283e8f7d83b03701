use super::TestContext;
use crate::failure::Result;
use crate::safe_call;
use crate::sync::{SyncConfig, SyncOutcome, Synchronizer, CHILD_BROKEN, CHILD_SUCCESS, CHILD_VIOLATION};
use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal};

/// Seconds before a pause02 child gives up waiting for SIGINT.
const CHILD_ALARM_SECS: u32 = 10;

extern "C" fn ignore_signal(_: libc::c_int) {}

/// Child of pause02: must leave pause() with EINTR once SIGINT arrives.
pub(crate) fn interruptible_pause() -> i32 {
    let installed = safe_call::set_disposition(Signal::SIGALRM, SigHandler::SigDfl)
        .and_then(|_| safe_call::set_disposition(Signal::SIGINT, SigHandler::Handler(ignore_signal)));
    if installed.is_err() {
        return CHILD_BROKEN;
    }

    // Commit suicide if SIGINT never comes
    unsafe { libc::alarm(CHILD_ALARM_SECS) };

    match Errno::result(unsafe { libc::pause() }) {
        Err(Errno::EINTR) => CHILD_SUCCESS,
        _ => CHILD_VIOLATION,
    }
}

/// Child of pause03: returning from pause() at all is a violation.
pub(crate) fn uninterruptible_pause() -> i32 {
    unsafe { libc::pause() };
    CHILD_VIOLATION
}

fn synchronizer(ctx: &TestContext<'_>, signal: Signal) -> Synchronizer {
    Synchronizer::new(SyncConfig {
        signal,
        ..ctx.options.sync.clone()
    })
}

pub(super) async fn pause02(ctx: &mut TestContext<'_>) -> Result<()> {
    let sync = synchronizer(ctx, Signal::SIGINT);
    let handle = sync.spawn(interruptible_pause)?;

    match sync.synchronize(handle).await? {
        SyncOutcome::Exited(CHILD_SUCCESS) => ctx.reporter.pass("pause() was interrupted correctly"),
        SyncOutcome::Exited(CHILD_BROKEN) => {
            ctx.reporter.broken("child could not install its signal handlers")
        }
        SyncOutcome::Exited(code) => ctx.reporter.fail(format!("Child exited with {code}")),
        SyncOutcome::SignaledBy(Signal::SIGALRM) => {
            ctx.reporter.fail("Timeout: SIGINT wasn't received by child")
        }
        SyncOutcome::SignaledBy(signal) => {
            ctx.reporter.fail(format!("Child killed by signal {signal}"))
        }
        SyncOutcome::TimedOut => ctx.reporter.timed_out(format!(
            "child never entered pause() within {:?}",
            sync.config().timeout
        )),
    }
    Ok(())
}

pub(super) async fn pause03(ctx: &mut TestContext<'_>) -> Result<()> {
    let sync = synchronizer(ctx, Signal::SIGKILL);
    let handle = sync.spawn(uninterruptible_pause)?;

    match sync.synchronize(handle).await? {
        SyncOutcome::SignaledBy(Signal::SIGKILL) => {
            ctx.reporter.pass("pause() did not return after SIGKILL")
        }
        SyncOutcome::Exited(CHILD_VIOLATION) => ctx.reporter.fail("Unexpected return from pause()"),
        SyncOutcome::Exited(code) => ctx.reporter.fail(format!("Child exited with {code}")),
        SyncOutcome::SignaledBy(signal) => {
            ctx.reporter.fail(format!("Child killed by signal {signal}"))
        }
        SyncOutcome::TimedOut => ctx.reporter.timed_out(format!(
            "child never entered pause() within {:?}",
            sync.config().timeout
        )),
    }
    Ok(())
}
