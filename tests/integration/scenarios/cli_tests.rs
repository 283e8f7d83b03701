use crate::infrastructure::ProcessTestHarness;
use anyhow::Result;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(60);

/// A passing run exits 0 and cleans up its scratch directory
#[tokio::test]
async fn test_passing_run_exits_zero() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    harness.set_environment("RUST_LOG", "debug");
    let output = harness.run_sysprobe(&["-i", "2", "pause03"], LIMIT).await?;

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(std::fs::read_dir(harness.temp_path())?.count(), 0);
    Ok(())
}

/// Invalid option values are rejected before anything runs
#[tokio::test]
async fn test_zero_pages_is_rejected() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = ProcessTestHarness::new()?;
    let output = harness.run_sysprobe(&["-m", "0", "mmap001"], LIMIT).await?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid size of mmap"), "{stderr}");
    Ok(())
}

/// Unknown case names are a usage error
#[tokio::test]
async fn test_unknown_case_is_rejected() -> Result<()> {
    let harness = ProcessTestHarness::new()?;
    let output = harness.run_sysprobe(&["nosuchcase"], LIMIT).await?;

    assert_eq!(output.status.code(), Some(2));
    Ok(())
}

/// A skipped case sets the configuration bit of the exit status
#[tokio::test]
async fn test_skipped_case_sets_conf_bit() -> Result<()> {
    if sysprobe::safe_call::is_root() {
        return Ok(());
    }
    let harness = ProcessTestHarness::new()?;
    let output = harness.run_sysprobe(&["mmap14"], LIMIT).await?;

    assert_eq!(output.status.code(), Some(32));
    Ok(())
}
