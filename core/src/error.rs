use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    /// The stream has used up its output quota. Everything that fit was
    /// delivered before this was returned; the stream stays exhausted.
    #[error("output quota of {limit} chars exceeded")]
    QuotaExceeded { limit: usize },
    #[error("invalid output quota: {quota} (must be greater than zero)")]
    InvalidQuota { quota: usize },
    #[error("invalid line buffer capacity: {capacity} (must be greater than zero)")]
    InvalidCapacity { capacity: usize },
    #[error("output sink is closed")]
    Closed,
    #[error("failed to write to output sink: {0}")]
    Io(#[from] io::Error),
}

impl OutputError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Recovers an `OutputError` that was smuggled through `std::io::Write`
    /// by [`crate::sink::SinkWriter`].
    pub fn from_io(error: &io::Error) -> Option<&OutputError> {
        error.get_ref()?.downcast_ref::<OutputError>()
    }
}

impl From<OutputError> for io::Error {
    fn from(error: OutputError) -> Self {
        match error {
            OutputError::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input read interrupted")]
    Interrupted,
    #[error("input channel is closed")]
    Closed,
}

// Not `ErrorKind::Interrupted`: std read helpers retry on that kind and the
// interrupt flag is sticky.
impl From<InputError> for io::Error {
    fn from(error: InputError) -> Self {
        match error {
            InputError::Interrupted => io::Error::other(error),
            InputError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, error),
        }
    }
}

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("failed to signal {label}: {source}")]
    Signal {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} has already finished")]
    AlreadyFinished(String),
    #[error("termination i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
