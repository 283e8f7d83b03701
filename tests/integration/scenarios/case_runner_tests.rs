use anyhow::Result;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::signal::Signal;
use serial_test::serial;
use std::time::Duration;
use sysprobe::cases::{run_case, Case, CaseOptions};
use sysprobe::platform::KCONFIG_PATH_ENV;
use sysprobe::report::Record;
use sysprobe::safe_call::{page_size, Mapping};
use sysprobe::{FaultProbe, Reporter, ResultKind, SyncConfig};
use tempfile::TempDir;

fn quick_options() -> CaseOptions {
    CaseOptions {
        sync: SyncConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        mmap_pages: 16,
        ..Default::default()
    }
}

async fn run(case: Case) -> Result<Vec<Record>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let scratch = TempDir::new()?;
    let mut reporter = Reporter::new();
    run_case(case, &quick_options(), scratch.path(), &mut reporter).await;

    // Every run leaves its directory behind only until the case ends
    assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
    Ok(reporter.records().to_vec())
}

fn kinds(records: &[Record]) -> Vec<ResultKind> {
    records.iter().map(|r| r.kind).collect()
}

#[tokio::test]
async fn test_pause02_passes() -> Result<()> {
    let records = run(Case::Pause02).await?;
    assert_eq!(kinds(&records), vec![ResultKind::Pass]);
    assert_eq!(records[0].case, "pause02");
    Ok(())
}

#[tokio::test]
async fn test_pause03_passes() -> Result<()> {
    let records = run(Case::Pause03).await?;
    assert_eq!(kinds(&records), vec![ResultKind::Pass]);
    Ok(())
}

#[tokio::test]
async fn test_mmap001_passes() -> Result<()> {
    let records = run(Case::Mmap001).await?;
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.kind == ResultKind::Pass), "{records:?}");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_mmap01_passes() -> Result<()> {
    let records = run(Case::Mmap01).await?;
    assert_eq!(kinds(&records), vec![ResultKind::Pass], "{records:?}");
    Ok(())
}

/// Whether this machine refuses plain reads of PROT_EXEC-only pages
fn exec_only_enforced() -> Result<bool> {
    let page = Mapping::map_anonymous(page_size()?, ProtFlags::PROT_EXEC, MapFlags::MAP_PRIVATE)?;
    let outcome = FaultProbe::new()
        .watching(&[Signal::SIGSEGV])
        .with_probe(|| {
            let byte = unsafe { page.as_ptr().read_volatile() };
            byte == 0
        })?;
    Ok(outcome.is_fault())
}

/// Runs mmap03 with `KCONFIG_PATH` pointing at a config holding `contents`
async fn run_mmap03_with_kconfig(contents: &str) -> Result<Vec<Record>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config");
    std::fs::write(&path, contents)?;

    std::env::set_var(KCONFIG_PATH_ENV, &path);
    let records = run(Case::Mmap03).await;
    std::env::remove_var(KCONFIG_PATH_ENV);
    records
}

#[tokio::test]
#[serial]
async fn test_mmap03_with_protection_keys() -> Result<()> {
    if std::env::consts::ARCH != "x86_64" {
        return Ok(());
    }
    let records =
        run_mmap03_with_kconfig("CONFIG_X86_INTEL_MEMORY_PROTECTION_KEYS=y\n").await?;

    if exec_only_enforced()? {
        assert_eq!(kinds(&records), vec![ResultKind::Pass], "{records:?}");
        assert_eq!(records[0].message, "Got SIGSEGV as expected");
    } else {
        assert!(records.iter().any(|r| r.kind == ResultKind::Fail
            && r.message == "Mapped memory region with NO access is accessible"));
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_mmap03_without_protection_keys() -> Result<()> {
    if std::env::consts::ARCH != "x86_64" {
        return Ok(());
    }
    let records = run_mmap03_with_kconfig(
        "# CONFIG_X86_INTEL_MEMORY_PROTECTION_KEYS is not set\nCONFIG_MMU=y\n",
    )
    .await?;

    // Either outcome passes, and it is always reported
    assert_eq!(kinds(&records), vec![ResultKind::Pass], "{records:?}");
    if exec_only_enforced()? {
        assert!(records[0].message.contains("exec-only mapping is enforced"));
    } else {
        assert_eq!(records[0].message, "mmap() functionality is correct");
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_mmap03_unreadable_kconfig_is_conf() -> Result<()> {
    if std::env::consts::ARCH != "x86_64" {
        return Ok(());
    }
    let dir = TempDir::new()?;
    std::env::set_var(KCONFIG_PATH_ENV, dir.path().join("missing"));
    let records = run(Case::Mmap03).await;
    std::env::remove_var(KCONFIG_PATH_ENV);

    assert_eq!(kinds(&records?), vec![ResultKind::Conf]);
    Ok(())
}

#[tokio::test]
async fn test_root_only_cases_skip_without_root() -> Result<()> {
    if sysprobe::safe_call::is_root() {
        return Ok(());
    }
    for case in [Case::Mmap10, Case::Mmap14] {
        let records = run(case).await?;
        assert_eq!(kinds(&records), vec![ResultKind::Conf]);
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_root_only_cases_pass_as_root() -> Result<()> {
    if !sysprobe::safe_call::is_root() {
        return Ok(());
    }
    let records = run(Case::Mmap10).await?;
    assert!(records.iter().all(|r| r.kind == ResultKind::Pass), "{records:?}");
    Ok(())
}
