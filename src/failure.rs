use std::fmt;
use std::io;

/// Result type used by every harness primitive and test body.
pub type Result<T> = std::result::Result<T, Failure>;

/// Classification of a failure raised while a test body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Environment or precondition failure unrelated to the behavior under test
    Broken,
    /// The kernel behaved contrary to the tested contract
    Fail,
    /// The test cannot run on this configuration
    Conf,
}

impl FailureKind {
    /// Short tag used in result lines
    pub fn tag(&self) -> &'static str {
        match self {
            FailureKind::Broken => "TBROK",
            FailureKind::Fail => "TFAIL",
            FailureKind::Conf => "TCONF",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A failure record: terminates the current test body, never the harness.
///
/// Failures travel up through `?`. The optional source carries the OS
/// error that triggered a Broken record from the safe-call layer.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Broken, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fail, message)
    }

    pub fn conf(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Conf, message)
    }

    /// Attaches the OS error that caused this failure.
    pub fn with_source(mut self, source: impl Into<io::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn os_error(&self) -> Option<&io::Error> {
        self.source.as_ref()
    }

    /// Message with the captured OS error appended, for result lines.
    pub fn detail(&self) -> String {
        match &self.source {
            Some(err) => format!("{}: {}", self.message, err),
            None => self.message.clone(),
        }
    }
}

/// Converts a raw OS result into a Broken failure naming the call.
///
/// Only for calls whose failure is *not* the behavior under test; those
/// stay raw so the test can inspect the error itself.
pub trait SafeCall<T> {
    fn safe(self, call: impl fmt::Display) -> Result<T>;
}

impl<T, E> SafeCall<T> for std::result::Result<T, E>
where
    E: Into<io::Error>,
{
    fn safe(self, call: impl fmt::Display) -> Result<T> {
        self.map_err(|err| Failure::broken(format!("{call} failed")).with_source(err))
    }
}

/// Raises Broken when an invariant of the test itself does not hold.
pub fn assert_expr(condition: bool, message: impl Into<String>) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Failure::broken(message))
    }
}
