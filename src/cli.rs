use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use sysprobe::cases::{Case, CaseOptions};
use sysprobe::SyncConfig;

type Result<T> = color_eyre::eyre::Result<T>;

/// Verify syscall behavior around signals, process suspension and mappings
#[derive(Parser)]
#[command(name = "sysprobe")]
#[command(about = "Verify syscall behavior around signals, process suspension and mappings")]
#[command(version)]
pub struct Cli {
    /// Run every selected case this many times
    #[arg(short = 'i', long, default_value = "1")]
    pub iterations: u32,

    /// Scheduling state a child must reach before it is signaled
    #[arg(long, default_value = "S")]
    pub target_state: char,

    /// Deadline for reaching the target state (ms)
    #[arg(long, default_value = "10000")]
    pub timeout_ms: u64,

    /// Interval between two scheduling state polls (ms)
    #[arg(long, default_value = "10")]
    pub poll_interval_ms: u64,

    /// Size of the mmap001 mapping in pages
    #[arg(short = 'm', long, default_value = "1000")]
    pub mmap_pages: usize,

    /// mmap10: test anonymous pages instead of /dev/zero
    #[arg(short = 'a', long)]
    pub anon: bool,

    /// mmap10: add the mapping to KSM regions
    #[arg(short = 's', long)]
    pub ksm: bool,

    /// Directory to create the scratch directory in (default: system temp dir)
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// List the available cases and exit
    #[arg(long)]
    pub list: bool,

    /// Cases to run (default: all)
    #[arg(value_enum)]
    pub cases: Vec<Case>,
}

/// Configuration for a harness run
#[derive(Debug, Clone)]
pub struct Config {
    /// Cases to run, in order
    pub cases: Vec<Case>,
    /// Number of passes over the cases
    pub iterations: u32,
    /// Options handed to every case
    pub options: CaseOptions,
    /// Parent of the scratch directory
    pub tmpdir: Option<PathBuf>,
    /// Only list the cases
    pub list: bool,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.mmap_pages == 0 {
            return Err(eyre!("Invalid size of mmap '{}'", cli.mmap_pages));
        }
        if cli.timeout_ms == 0 || cli.poll_interval_ms == 0 {
            return Err(eyre!("timeout and poll interval must be positive"));
        }
        if !cli.target_state.is_ascii_alphabetic() {
            return Err(eyre!("Invalid scheduling state '{}'", cli.target_state));
        }

        let cases = if cli.cases.is_empty() {
            Case::ALL.to_vec()
        } else {
            cli.cases
        };

        Ok(Config {
            cases,
            iterations: cli.iterations,
            options: CaseOptions {
                sync: SyncConfig {
                    target_state: cli.target_state,
                    timeout: Duration::from_millis(cli.timeout_ms),
                    poll_interval: Duration::from_millis(cli.poll_interval_ms),
                    ..Default::default()
                },
                mmap_pages: cli.mmap_pages,
                anon: cli.anon,
                ksm: cli.ksm,
            },
            tmpdir: cli.tmpdir,
            list: cli.list,
        })
    }
}
