//! Per-architecture fault expectations and the kernel config query.

use crate::failure::{Failure, Result, SafeCall};
use flate2::read::GzDecoder;
use nix::sys::signal::Signal;
use nix::sys::utsname::uname;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable pointing at a kernel config, plain or gzipped.
pub const KCONFIG_PATH_ENV: &str = "KCONFIG_PATH";

/// Config of the running kernel when built with `CONFIG_IKCONFIG_PROC`.
pub const PROC_CONFIG_GZ: &str = "/proc/config.gz";

/// Kernel option deciding whether x86_64 enforces exec-only mappings.
pub const X86_PKEYS_OPTION: &str = "CONFIG_X86_INTEL_MEMORY_PROTECTION_KEYS";

/// What a probe reading an exec-only mapping must observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultExpectation {
    /// The read must raise SIGSEGV
    MustFault,
    /// The read must succeed
    MustNotFault,
    /// Either outcome is acceptable
    Unconstrained,
}

impl FaultExpectation {
    /// Signals a probe should accept as the expected fault.
    pub fn expected_signals(&self) -> &'static [Signal] {
        match self {
            FaultExpectation::MustFault | FaultExpectation::Unconstrained => &[Signal::SIGSEGV],
            FaultExpectation::MustNotFault => &[],
        }
    }
}

/// A row of the platform table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchRule {
    Always(FaultExpectation),
    /// Depends on a boolean kernel option
    Kconfig {
        option: &'static str,
        enabled: FaultExpectation,
        disabled: FaultExpectation,
    },
}

/// Architectures whose exec-only mappings are not readable.
///
/// Keys are `std::env::consts::ARCH` values; architectures Rust has no
/// target for are kept so the table reads as the full policy.
const EXEC_ONLY_TABLE: &[(&str, ArchRule)] = &[
    ("ia64", ArchRule::Always(FaultExpectation::MustFault)),
    ("hppa", ArchRule::Always(FaultExpectation::MustFault)),
    ("parisc", ArchRule::Always(FaultExpectation::MustFault)),
    ("mips", ArchRule::Always(FaultExpectation::MustFault)),
    ("mips64", ArchRule::Always(FaultExpectation::MustFault)),
    ("mips32r6", ArchRule::Always(FaultExpectation::MustFault)),
    ("mips64r6", ArchRule::Always(FaultExpectation::MustFault)),
    (
        "x86_64",
        ArchRule::Kconfig {
            option: X86_PKEYS_OPTION,
            enabled: FaultExpectation::MustFault,
            disabled: FaultExpectation::Unconstrained,
        },
    ),
];

/// Looks up the exec-only read rule for `arch`.
pub fn exec_only_rule(arch: &str) -> ArchRule {
    EXEC_ONLY_TABLE
        .iter()
        .find(|(name, _)| *name == arch)
        .map(|(_, rule)| *rule)
        .unwrap_or(ArchRule::Always(FaultExpectation::MustNotFault))
}

/// Resolves a rule, reading the kernel config only when the rule needs it.
pub fn resolve<F>(rule: ArchRule, kconfig_enabled: F) -> Result<FaultExpectation>
where
    F: FnOnce(&str) -> Result<bool>,
{
    match rule {
        ArchRule::Always(expectation) => Ok(expectation),
        ArchRule::Kconfig {
            option,
            enabled,
            disabled,
        } => {
            let on = kconfig_enabled(option)?;
            debug!("{} is {}", option, if on { "set" } else { "not set" });
            Ok(if on { enabled } else { disabled })
        }
    }
}

/// Expectation for the running architecture and kernel.
pub fn exec_only_expectation() -> Result<FaultExpectation> {
    resolve(exec_only_rule(std::env::consts::ARCH), |option| {
        KernelConfig::load().map(|config| config.is_enabled(option))
    })
}

/// Parsed `CONFIG_*` assignments of a kernel `.config`.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    values: HashMap<String, String>,
}

impl KernelConfig {
    /// Loads the config of the running kernel.
    ///
    /// Uses `$KCONFIG_PATH` when set, else `/proc/config.gz`, else
    /// `/boot/config-<release>`. Raises Conf when no readable config exists.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(KCONFIG_PATH_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let proc_config = Path::new(PROC_CONFIG_GZ);
        if proc_config.exists() {
            return Self::from_path(proc_config);
        }
        let release = uname().safe("uname")?.release().to_string_lossy().into_owned();
        Self::from_path(&PathBuf::from(format!("/boot/config-{release}")))
    }

    /// Reads a config file; a `.gz` extension means gzip compressed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Failure::conf(format!("cannot read kernel config {}", path.display())).with_source(e)
        })?;

        let mut text = String::new();
        let read = if path.extension().is_some_and(|ext| ext == "gz") {
            GzDecoder::new(file).read_to_string(&mut text)
        } else {
            (&file).read_to_string(&mut text)
        };
        read.map_err(|e| {
            Failure::broken(format!("cannot decode kernel config {}", path.display()))
                .with_source(e)
        })?;

        debug!("parsing kernel config {}", path.display());
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("CONFIG_"))
            .filter_map(|line| line.split_once('='))
            .map(|(name, value)| (name.to_string(), value.trim_matches('"').to_string()))
            .collect();
        Self { values }
    }

    /// Boolean query: true only for `=y`.
    pub fn is_enabled(&self, option: &str) -> bool {
        self.values.get(option).is_some_and(|v| v == "y")
    }
}
