use super::TestContext;
use crate::failure::{assert_expr, Failure, Result};
use crate::platform::{self, FaultExpectation};
use crate::probe::{FaultProbe, ProbeOutcome};
use crate::report::ResultKind;
use crate::safe_call::{self, Mapping};
use crate::sync::{exit_code, SyncOutcome, Synchronizer, CHILD_BROKEN, CHILD_SUCCESS, CHILD_VIOLATION};
use nix::sys::mman::{MapFlags, MmapAdvise, MsFlags, ProtFlags};
use nix::sys::signal::Signal;
use std::fs::{File, OpenOptions};
use std::io::{Read, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;

const TEMPFILE: &str = "mmapfile";
const HELLO: &[u8] = b"hello world";
/// Bytes written past EOF by mmap01; none of them may reach the file.
const PAST_EOF_PATTERN: &[u8] = b"XYZ";

/// Half of the mmap10 mapping.
const MMAP10_SIZE: usize = 5 * 1024 * 1024;
const MMAP10_CHILDREN: usize = 3;
const KSM_PATH: &str = "/sys/kernel/mm/ksm/";

const MMAP14_SIZE: usize = 1 << 20;

fn create_rw(path: &Path) -> Result<File> {
    safe_call::open(
        path,
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666),
    )
}

pub(super) async fn mmap001(ctx: &mut TestContext<'_>) -> Result<()> {
    let pages = ctx.options.mmap_pages;
    let memsize = pages
        .checked_mul(safe_call::page_size()?)
        .ok_or_else(|| Failure::broken(format!("{pages} pages overflow the address space")))?;
    ctx.reporter
        .info(format!("mmap()ing file of {pages} pages or {memsize} bytes"));

    let mut file = create_rw(&ctx.workdir.join("testfile"))?;
    safe_call::seek(&mut file, SeekFrom::Start(memsize as u64))?;
    safe_call::write_all(&mut file, b"\0")?;

    let sync = Synchronizer::new(ctx.options.sync.clone());
    ctx.reporter.info("touching mmapped memory");
    let mut handle = sync.spawn(|| exit_code(touch_every_byte(&file, memsize)))?;

    match sync.reap(&mut handle).await? {
        SyncOutcome::SignaledBy(Signal::SIGSEGV) => ctx.reporter.fail("test was killed by SIGSEGV"),
        SyncOutcome::Exited(CHILD_SUCCESS) => ctx
            .reporter
            .pass("memory was mapped and written to successfully"),
        SyncOutcome::Exited(CHILD_BROKEN) => {
            ctx.reporter.broken("child could not map or sync the file")
        }
        other => ctx.reporter.fail(format!("child ended with {other:?}")),
    }
    Ok(())
}

fn touch_every_byte(file: &File, memsize: usize) -> Result<bool> {
    let mapping = Mapping::map_file(
        memsize,
        ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
        file,
        0,
    )?;
    let base = mapping.as_ptr();
    for i in 0..mapping.len() {
        unsafe { ptr::write_volatile(base.add(i), i as u8) };
    }
    mapping.msync(MsFlags::MS_SYNC)?;
    mapping.unmap()?;
    Ok(true)
}

pub(super) async fn mmap01(ctx: &mut TestContext<'_>) -> Result<()> {
    let path = ctx.workdir.join(TEMPFILE);
    let mut file = create_rw(&path)?;
    safe_call::write_all(&mut file, HELLO)?;
    let file_sz = safe_call::file_len(&file)? as usize;
    let page_sz = safe_call::page_size()?;
    assert_expr(
        file_sz + PAST_EOF_PATTERN.len() <= page_sz,
        "file must leave room for the pattern in its last page",
    )?;

    let mut mapping = Mapping::map_file(
        page_sz,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
        &file,
        0,
    )?;

    // The tail of the last page past EOF must read back as zeroes
    let tail = FaultProbe::new().with_probe(|| {
        let bytes = unsafe { mapping.as_slice() };
        bytes[file_sz..].iter().all(|&b| b == 0)
    })?;
    match tail {
        ProbeOutcome::Completed { held: true } => {}
        ProbeOutcome::Completed { held: false } => {
            return Err(Failure::fail("mapped memory area contains invalid data"))
        }
        faulted => {
            return Err(Failure::fail(format!(
                "mapped memory area past EOF is not accessible: {faulted:?}"
            )))
        }
    }

    let bytes = unsafe { mapping.as_mut_slice() };
    bytes[file_sz..file_sz + PAST_EOF_PATTERN.len()].copy_from_slice(PAST_EOF_PATTERN);

    if let Err(e) = mapping.msync(MsFlags::MS_SYNC) {
        ctx.reporter.fail(format!(
            "failed to synchronize mapped file: {}",
            e.detail()
        ));
        return Ok(());
    }

    let sync = Synchronizer::new(ctx.options.sync.clone());
    let mut handle = sync.spawn(|| exit_code(pattern_absent(&path)))?;
    match sync.reap(&mut handle).await? {
        SyncOutcome::Exited(CHILD_SUCCESS) => ctx.reporter.pass("Functionality of mmap() successful"),
        SyncOutcome::Exited(CHILD_VIOLATION) => ctx.reporter.fail("Specified pattern found in file"),
        other => ctx
            .reporter
            .broken(format!("file checker ended with {other:?}")),
    }

    mapping.unmap()
}

/// Rereads the file through a fresh descriptor and looks for the pattern.
fn pattern_absent(path: &Path) -> Result<bool> {
    let mut file = safe_call::open(path, OpenOptions::new().read(true))?;
    let mut buf = [0u8; HELLO.len() + 1 + PAST_EOF_PATTERN.len()];
    let read = file
        .read(&mut buf)
        .map_err(|e| Failure::broken(format!("read({})", path.display())).with_source(e))?;
    Ok(!buf[..read].iter().any(|b| PAST_EOF_PATTERN.contains(b)))
}

/// Result lines mmap03 reports for a probe outcome under an expectation.
pub fn exec_only_verdict(
    expectation: FaultExpectation,
    outcome: ProbeOutcome,
) -> Option<(ResultKind, String)> {
    match (expectation, outcome) {
        (_, ProbeOutcome::FaultedUnexpected(signal)) => {
            Some((ResultKind::Fail, format!("Got unexpected {signal}")))
        }
        (FaultExpectation::MustFault, ProbeOutcome::FaultedExpected(_)) => {
            Some((ResultKind::Pass, "Got SIGSEGV as expected".to_string()))
        }
        (FaultExpectation::MustFault, ProbeOutcome::Completed { .. }) => Some((
            ResultKind::Fail,
            "Mapped memory region with NO access is accessible".to_string(),
        )),
        (FaultExpectation::MustNotFault, ProbeOutcome::FaultedExpected(signal)) => {
            Some((ResultKind::Fail, format!("Got unexpected {signal}")))
        }
        (FaultExpectation::Unconstrained, ProbeOutcome::FaultedExpected(signal)) => Some((
            ResultKind::Pass,
            format!("Got {signal}: exec-only mapping is enforced"),
        )),
        (
            FaultExpectation::MustNotFault | FaultExpectation::Unconstrained,
            ProbeOutcome::Completed { .. },
        ) => None,
    }
}

/// mmap03 recovers from SIGSEGV only.
pub(crate) fn exec_only_watch(expectation: FaultExpectation) -> FaultProbe {
    FaultProbe::new()
        .watching(&[Signal::SIGSEGV])
        .expecting(expectation.expected_signals())
}

pub(super) fn mmap03(ctx: &mut TestContext<'_>) -> Result<()> {
    let expectation = platform::exec_only_expectation()?;
    let page_sz = safe_call::page_size()?;
    let path = ctx.workdir.join(TEMPFILE);

    {
        let mut writer = create_rw(&path)?;
        safe_call::write_all(&mut writer, &vec![b'A'; page_sz])?;
        safe_call::fchmod(&writer, 0o555)?;
    }
    let mut file = safe_call::open(&path, OpenOptions::new().read(true))?;

    let mapping = Mapping::map_file(
        page_sz,
        ProtFlags::PROT_EXEC,
        MapFlags::MAP_SHARED,
        &file,
        0,
    )?;
    let mut contents = vec![0u8; page_sz];
    safe_call::read_exact(&mut file, &mut contents)?;

    // Exec-only pages may not be readable: this read is allowed to fault
    let outcome = exec_only_watch(expectation).with_probe(|| {
        let bytes = unsafe { mapping.as_slice() };
        bytes == contents.as_slice()
    })?;

    if let ProbeOutcome::Completed { held } = outcome {
        if held {
            ctx.reporter.info("memcmp returned zero");
            ctx.reporter.pass("mmap() functionality is correct");
        } else {
            ctx.reporter.info("memcmp returned non-zero");
            ctx.reporter
                .fail("mapped memory region contains invalid data");
        }
    }

    if let Some((kind, message)) = exec_only_verdict(expectation, outcome) {
        ctx.reporter.record(kind, message);
    }

    mapping.unmap()
}

pub(super) async fn mmap10(ctx: &mut TestContext<'_>) -> Result<()> {
    if ctx.options.ksm {
        if !Path::new(KSM_PATH).exists() {
            return Err(Failure::conf("KSM configuration is not enabled"));
        }
        ctx.reporter.info("add to KSM regions.");
    }
    if ctx.options.anon {
        ctx.reporter.info("use anonymous pages.");
    } else {
        ctx.reporter.info("use /dev/zero.");
    }

    let ps = safe_call::page_size()?;
    let len = MMAP10_SIZE + MMAP10_SIZE - ps;
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

    ctx.reporter.info("start tests.");
    let (mapping, _zero) = if ctx.options.anon {
        (Mapping::map_anonymous(len, prot, MapFlags::MAP_PRIVATE)?, None)
    } else {
        let zero = safe_call::open(
            Path::new("/dev/zero"),
            OpenOptions::new().read(true).write(true),
        )?;
        let mapping = Mapping::map_file(len, prot, MapFlags::MAP_PRIVATE, &zero, 0)?;
        (mapping, Some(zero))
    };
    if ctx.options.ksm {
        mapping.madvise(MmapAdvise::MADV_MERGEABLE)?;
    }
    unsafe { ptr::write_volatile(mapping.as_ptr().add(MMAP10_SIZE), 0) };

    let sync = Synchronizer::new(ctx.options.sync.clone());
    let mut children = Vec::with_capacity(MMAP10_CHILDREN);
    for _ in 0..MMAP10_CHILDREN {
        children.push(sync.spawn(|| {
            let unmapped = unsafe { mapping.unmap_range(MMAP10_SIZE + ps, MMAP10_SIZE - ps - ps) };
            exit_code(unmapped.map(|()| true))
        })?);
    }

    mapping.unmap()?;

    let mut clean = true;
    for handle in &mut children {
        match sync.reap(handle).await? {
            SyncOutcome::Exited(CHILD_SUCCESS) => {}
            SyncOutcome::Exited(code) => {
                clean = false;
                ctx.reporter.fail(format!("child exit status is {code}"));
            }
            other => {
                clean = false;
                ctx.reporter.fail(format!("child ended with {other:?}"));
            }
        }
    }

    if clean {
        ctx.reporter
            .pass("mmap/munmap operations completed successfully");
    }
    Ok(())
}

/// Extracts the `VmLck` value, in kB, from `/proc/<pid>/status`.
pub fn parse_vm_locked_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmLck:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

fn vm_locked_kb() -> Result<u64> {
    let status = safe_call::read_to_string(Path::new("/proc/self/status"))?;
    parse_vm_locked_kb(&status)
        .ok_or_else(|| Failure::broken("Get lock size failed: no VmLck in /proc/self/status"))
}

pub(super) fn mmap14(ctx: &mut TestContext<'_>) -> Result<()> {
    let before = vm_locked_kb()?;

    // The mapping itself is the call under test: its failure is a FAIL
    let mapping = match Mapping::map_anonymous(
        MMAP14_SIZE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_LOCKED,
    ) {
        Ok(mapping) => mapping,
        Err(e) => {
            ctx.reporter
                .fail(format!("mmap with MAP_LOCKED failed: {}", e.detail()));
            return Ok(());
        }
    };

    let after = vm_locked_kb()?;
    let locked = after as i64 - before as i64;
    let expected = (MMAP14_SIZE / 1024) as i64;
    if locked == expected {
        ctx.reporter.pass("Functionality of mmap() successful");
    } else {
        ctx.reporter.fail(format!(
            "Expected {expected}K locked, get {locked}K locked"
        ));
    }

    if let Err(e) = mapping.unmap() {
        ctx.reporter.fail(format!("munmap failed: {}", e.detail()));
    }
    Ok(())
}
