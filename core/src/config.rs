use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_LINE_BUFFER_SIZE: usize = 1024;
const DEFAULT_INTERRUPT_GRACE_MS: u64 = 5_000;
const DEFAULT_STOP_GRACE_MS: u64 = 1_000;
const DEFAULT_THREAD_NAME_FORMAT: &str = "evalchan-session-{}";
pub(crate) const NAME_PLACEHOLDER: &str = "{}";

/// Tunables for one session's output/input channel and its cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Maximum number of chars a single output stream may ever emit.
    /// `None` leaves the stream unbounded.
    pub output_quota: Option<usize>,
    /// Bytes the line-buffered aggregator may hold before a forced release.
    pub line_buffer_size: usize,
    pub interrupt_grace_ms: u64,
    pub stop_grace_ms: u64,
    /// Worker thread name; `{}` is replaced by a per-factory counter.
    pub thread_name_format: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_quota: None,
            line_buffer_size: DEFAULT_LINE_BUFFER_SIZE,
            interrupt_grace_ms: DEFAULT_INTERRUPT_GRACE_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            thread_name_format: DEFAULT_THREAD_NAME_FORMAT.to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_quota == Some(0) {
            return Err(ConfigError::invalid(
                "output_quota",
                "must be greater than zero (omit it for no quota)",
            ));
        }
        if self.line_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "line_buffer_size",
                "must be greater than zero",
            ));
        }
        if !self.thread_name_format.contains(NAME_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "thread_name_format",
                format!("must contain a `{NAME_PLACEHOLDER}` placeholder"),
            ));
        }
        Ok(())
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
