//! Test cases built on the synchronizer and the fault probe.

mod mmap;
mod pause;

pub use mmap::{exec_only_verdict, parse_vm_locked_kb};

use crate::failure::{Failure, Result};
use crate::report::Reporter;
use crate::safe_call;
use crate::sync::SyncConfig;
use std::path::Path;
use tracing::debug;

/// Options shared by every case.
#[derive(Debug, Clone)]
pub struct CaseOptions {
    /// Synchronization defaults; cases override the signal they deliver
    pub sync: SyncConfig,
    /// Size of the mmap001 mapping in pages
    pub mmap_pages: usize,
    /// mmap10: map anonymous memory instead of /dev/zero
    pub anon: bool,
    /// mmap10: register the mapping with KSM
    pub ksm: bool,
}

impl Default for CaseOptions {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            mmap_pages: 1000,
            anon: false,
            ksm: false,
        }
    }
}

/// Everything a running case may touch.
pub struct TestContext<'a> {
    pub options: &'a CaseOptions,
    /// Private scratch directory of this run
    pub workdir: &'a Path,
    pub reporter: &'a mut Reporter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Case {
    #[value(name = "pause02")]
    Pause02,
    #[value(name = "pause03")]
    Pause03,
    #[value(name = "mmap001")]
    Mmap001,
    #[value(name = "mmap01")]
    Mmap01,
    #[value(name = "mmap03")]
    Mmap03,
    #[value(name = "mmap10")]
    Mmap10,
    #[value(name = "mmap14")]
    Mmap14,
}

impl Case {
    pub const ALL: [Case; 7] = [
        Case::Pause02,
        Case::Pause03,
        Case::Mmap001,
        Case::Mmap01,
        Case::Mmap03,
        Case::Mmap10,
        Case::Mmap14,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Case::Pause02 => "pause02",
            Case::Pause03 => "pause03",
            Case::Mmap001 => "mmap001",
            Case::Mmap01 => "mmap01",
            Case::Mmap03 => "mmap03",
            Case::Mmap10 => "mmap10",
            Case::Mmap14 => "mmap14",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Case::Pause02 => "pause() returns EINTR when a caught signal arrives",
            Case::Pause03 => "pause() never returns after SIGKILL",
            Case::Mmap001 => "write every byte of a large shared file mapping",
            Case::Mmap01 => "bytes past EOF are zeroed and never written back",
            Case::Mmap03 => "PROT_EXEC mapping readability per architecture",
            Case::Mmap10 => "map and partially unmap /dev/zero across forks",
            Case::Mmap14 => "MAP_LOCKED locks the mapped pages",
        }
    }

    pub fn needs_root(&self) -> bool {
        matches!(self, Case::Mmap10 | Case::Mmap14)
    }

    async fn run(self, ctx: &mut TestContext<'_>) -> Result<()> {
        match self {
            Case::Pause02 => pause::pause02(ctx).await,
            Case::Pause03 => pause::pause03(ctx).await,
            Case::Mmap001 => mmap::mmap001(ctx).await,
            Case::Mmap01 => mmap::mmap01(ctx).await,
            Case::Mmap03 => mmap::mmap03(ctx),
            Case::Mmap10 => mmap::mmap10(ctx).await,
            Case::Mmap14 => mmap::mmap14(ctx),
        }
    }
}

/// Runs one case in a fresh directory under `base`.
///
/// A failure returned by the case body is recorded with its kind; it
/// never escapes to the caller.
pub async fn run_case(case: Case, options: &CaseOptions, base: &Path, reporter: &mut Reporter) {
    reporter.begin(case.name());

    if case.needs_root() && !safe_call::is_root() {
        reporter.conf("test requires root privileges");
        reporter.end();
        return;
    }

    let workdir = match tempfile::Builder::new()
        .prefix(case.name())
        .tempdir_in(base)
    {
        Ok(dir) => dir,
        Err(e) => {
            reporter.failure(
                &Failure::broken(format!("cannot create work dir in {}", base.display()))
                    .with_source(e),
            );
            reporter.end();
            return;
        }
    };
    debug!("{} runs in {}", case.name(), workdir.path().display());

    let mut ctx = TestContext {
        options,
        workdir: workdir.path(),
        reporter: &mut *reporter,
    };
    if let Err(failure) = case.run(&mut ctx).await {
        reporter.failure(&failure);
    }
    reporter.end();
}
