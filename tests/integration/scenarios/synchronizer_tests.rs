use crate::infrastructure::Timeline;
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use serial_test::serial;
use std::time::{Duration, Instant};
use sysprobe::safe_call::SharedPage;
use sysprobe::sync::{CHILD_SUCCESS, CHILD_VIOLATION};
use sysprobe::{SyncConfig, SyncOutcome, Synchronizer};
use tracing::debug;

extern "C" fn noop(_: libc::c_int) {}

fn pause_until_interrupted() -> i32 {
    if unsafe { signal::signal(Signal::SIGINT, SigHandler::Handler(noop)) }.is_err() {
        return CHILD_VIOLATION;
    }
    match Errno::result(unsafe { libc::pause() }) {
        Err(Errno::EINTR) => CHILD_SUCCESS,
        _ => CHILD_VIOLATION,
    }
}

/// A child blocked in pause() with a no-op SIGINT handler exits cleanly
#[tokio::test]
async fn test_interrupt_with_noop_handler_exits_zero() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sync = Synchronizer::new(SyncConfig {
        signal: Signal::SIGINT,
        ..Default::default()
    });
    let handle = sync.spawn(pause_until_interrupted)?;

    assert_eq!(sync.synchronize(handle).await?, SyncOutcome::Exited(0));
    Ok(())
}

/// SIGKILL cannot be caught, so the child is reported as signaled
#[tokio::test]
async fn test_kill_reports_signaled_by_kill() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sync = Synchronizer::new(SyncConfig {
        signal: Signal::SIGKILL,
        ..Default::default()
    });
    let handle = sync.spawn(pause_until_interrupted)?;

    assert_eq!(
        sync.synchronize(handle).await?,
        SyncOutcome::SignaledBy(Signal::SIGKILL)
    );
    Ok(())
}

/// Early exit is detected from the process state, not by waiting out the deadline
#[tokio::test]
async fn test_early_exit_is_detected_before_deadline() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sync = Synchronizer::default();
    let mut handle = sync.spawn(|| CHILD_SUCCESS)?;

    let timeout = Duration::from_secs(10);
    let started = Instant::now();
    let reached = sync.wait_for_state(&handle, 'S', timeout).await?;
    let elapsed = started.elapsed();
    debug!("early exit detected after {:?}", elapsed);

    assert!(!reached, "an exited child never reaches the sleeping state");
    assert!(
        elapsed < Duration::from_secs(2),
        "early exit should be noticed well before the deadline, took {:?}",
        elapsed
    );

    assert_eq!(sync.reap(&mut handle).await?, SyncOutcome::Exited(CHILD_SUCCESS));
    Ok(())
}

/// The signal goes out only after the child has entered its blocking call
#[tokio::test]
#[serial]
async fn test_signal_is_sent_after_state_is_reached() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let timeline = SharedPage::<Timeline>::new()?;
    let sync = Synchronizer::default();

    let mut handle = sync.spawn(|| {
        if unsafe { signal::signal(Signal::SIGINT, SigHandler::Handler(noop)) }.is_err() {
            return CHILD_VIOLATION;
        }
        Timeline::stamp(&timeline.entered);
        let _ = unsafe { libc::pause() };
        Timeline::stamp(&timeline.woke);
        CHILD_SUCCESS
    })?;

    let config = sync.config().clone();
    assert!(
        sync.wait_for_state(&handle, config.target_state, config.timeout)
            .await?
    );
    Timeline::stamp(&timeline.sent);
    let outcome = sync.signal_and_reap(&mut handle, Signal::SIGINT).await?;
    assert_eq!(outcome, SyncOutcome::Exited(CHILD_SUCCESS));

    let entered = Timeline::get(&timeline.entered);
    let sent = Timeline::get(&timeline.sent);
    let woke = Timeline::get(&timeline.woke);
    debug!("entered={} sent={} woke={}", entered, sent, woke);

    assert!(entered != 0, "child never recorded entering pause()");
    assert!(entered <= sent, "signal sent before the child blocked");
    assert!(sent <= woke, "child woke before the signal was sent");
    Ok(())
}

/// A child that never blocks is cleaned up and reported as timed out
#[tokio::test]
async fn test_busy_child_times_out() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sync = Synchronizer::new(SyncConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let handle = sync.spawn(|| loop {
        std::hint::spin_loop();
    })?;

    assert_eq!(sync.synchronize(handle).await?, SyncOutcome::TimedOut);
    Ok(())
}
