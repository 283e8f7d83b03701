use crate::failure::{Failure, FailureKind};
use std::fmt;
use tracing::{error, info, warn};

/// Kind of a reported result line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Pass,
    Fail,
    Broken,
    Conf,
    /// The synchronization precondition was never reached: inconclusive
    TimedOut,
}

impl ResultKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ResultKind::Pass => "TPASS",
            ResultKind::Fail => "TFAIL",
            ResultKind::Broken => "TBROK",
            ResultKind::Conf => "TCONF",
            ResultKind::TimedOut => "TTIMEDOUT",
        }
    }

    /// Bit contributed to the process exit code.
    pub fn exit_bit(&self) -> i32 {
        match self {
            ResultKind::Pass => 0,
            ResultKind::Fail => 1,
            ResultKind::Broken => 2,
            ResultKind::TimedOut => 4,
            ResultKind::Conf => 32,
        }
    }
}

impl From<FailureKind> for ResultKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Broken => ResultKind::Broken,
            FailureKind::Fail => ResultKind::Fail,
            FailureKind::Conf => ResultKind::Conf,
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub case: String,
    pub kind: ResultKind,
    pub message: String,
}

/// Counts per result kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub broken: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passed {} failed {} broken {} skipped {} timed out {}",
            self.passed, self.failed, self.broken, self.skipped, self.timed_out
        )
    }
}

/// Collects the results test cases report and logs each of them.
#[derive(Debug, Default)]
pub struct Reporter {
    current: String,
    case_start: usize,
    records: Vec<Record>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts attributing results to `case`.
    pub fn begin(&mut self, case: &str) {
        self.current = case.to_string();
        self.case_start = self.records.len();
        info!("{}: starting", case);
    }

    /// Closes the current case; a case that reported nothing is Broken.
    pub fn end(&mut self) {
        if self.records.len() == self.case_start {
            self.broken("test did not report any result");
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        info!("{}: TINFO: {}", self.current, message.as_ref());
    }

    pub fn pass(&mut self, message: impl Into<String>) {
        self.record(ResultKind::Pass, message.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.record(ResultKind::Fail, message.into());
    }

    pub fn broken(&mut self, message: impl Into<String>) {
        self.record(ResultKind::Broken, message.into());
    }

    pub fn conf(&mut self, message: impl Into<String>) {
        self.record(ResultKind::Conf, message.into());
    }

    pub fn timed_out(&mut self, message: impl Into<String>) {
        self.record(ResultKind::TimedOut, message.into());
    }

    /// Records a failure that ended a test body.
    pub fn failure(&mut self, failure: &Failure) {
        self.record(failure.kind().into(), failure.detail());
    }

    pub fn record(&mut self, kind: ResultKind, message: String) {
        match kind {
            ResultKind::Pass | ResultKind::Conf => {
                info!("{}: {}: {}", self.current, kind, message)
            }
            ResultKind::Fail | ResultKind::TimedOut => {
                warn!("{}: {}: {}", self.current, kind, message)
            }
            ResultKind::Broken => error!("{}: {}: {}", self.current, kind, message),
        }
        self.records.push(Record {
            case: self.current.clone(),
            kind,
            message,
        });
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for record in &self.records {
            match record.kind {
                ResultKind::Pass => summary.passed += 1,
                ResultKind::Fail => summary.failed += 1,
                ResultKind::Broken => summary.broken += 1,
                ResultKind::Conf => summary.skipped += 1,
                ResultKind::TimedOut => summary.timed_out += 1,
            }
        }
        summary
    }

    /// Bitwise OR of the exit bits of every result.
    pub fn exit_code(&self) -> i32 {
        self.records
            .iter()
            .fold(0, |code, record| code | record.kind.exit_bit())
    }
}
