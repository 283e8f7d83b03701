use crate::infrastructure::MappedFile;
use anyhow::Result;
use nix::sys::signal::Signal;
use serial_test::serial;
use sysprobe::safe_call::current_handler;
use sysprobe::{FaultProbe, ProbeOutcome};

const CONTENTS: &[u8] = b"short file, much less than a page\n";

/// One byte past EOF still lies inside the last mapped page and reads as zero
#[test]
#[serial]
fn test_byte_past_eof_in_last_page_is_readable() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mapped = MappedFile::new(CONTENTS, 1)?;
    let outcome = FaultProbe::new().with_probe(|| {
        let byte = unsafe { mapped.read_at(mapped.file_len) };
        byte == 0
    })?;

    assert_eq!(outcome, ProbeOutcome::Completed { held: true });
    Ok(())
}

/// Reading past the final page of the mapping takes SIGSEGV
#[test]
#[serial]
fn test_read_past_final_page_faults() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    // Two pages are mapped and the probe child drops the second one, so the
    // address right after its last page is a guaranteed hole
    let mapped = MappedFile::new(CONTENTS, 2)?;
    let page = mapped.page_size;
    let outcome = FaultProbe::new().with_probe(|| {
        if unsafe { mapped.mapping.unmap_range(page, page) }.is_err() {
            return false;
        }
        unsafe { mapped.read_at(page) };
        true
    })?;

    assert_eq!(outcome, ProbeOutcome::FaultedExpected(Signal::SIGSEGV));
    Ok(())
}

/// A mapped page wholly beyond EOF raises SIGBUS, which is watched but not expected
#[test]
#[serial]
fn test_page_beyond_eof_is_unexpected_bus_error() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mapped = MappedFile::new(CONTENTS, 2)?;
    let outcome = FaultProbe::new().with_probe(|| {
        unsafe { mapped.read_at(mapped.page_size) };
        true
    })?;

    assert_eq!(outcome, ProbeOutcome::FaultedUnexpected(Signal::SIGBUS));
    Ok(())
}

/// Allowing SIGBUS turns the same access into an expected fault
#[test]
#[serial]
fn test_expecting_bus_error() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mapped = MappedFile::new(CONTENTS, 2)?;
    let probe = FaultProbe::new().expecting(&[Signal::SIGBUS]);
    let outcome = probe.with_probe(|| {
        unsafe { mapped.read_at(mapped.page_size) };
        true
    })?;

    assert_eq!(outcome, ProbeOutcome::FaultedExpected(Signal::SIGBUS));
    Ok(())
}

/// Consecutive completed probes leave the handlers exactly as they found them
#[test]
#[serial]
fn test_consecutive_probes_leave_handlers_unchanged() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let segv_before = current_handler(Signal::SIGSEGV)?;
    let bus_before = current_handler(Signal::SIGBUS)?;

    let mapped = MappedFile::new(CONTENTS, 1)?;
    let probe = FaultProbe::new();
    for _ in 0..2 {
        let outcome = probe.with_probe(|| {
            let byte = unsafe { mapped.read_at(0) };
            byte == CONTENTS[0]
        })?;
        assert_eq!(outcome, ProbeOutcome::Completed { held: true });
        assert_eq!(current_handler(Signal::SIGSEGV)?, segv_before);
        assert_eq!(current_handler(Signal::SIGBUS)?, bus_before);
    }
    Ok(())
}
