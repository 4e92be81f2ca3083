use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::warn;

use super::TextSink;
use super::lock_state;
use crate::error::OutputError;

/// Caps the total number of chars ever written through it.
///
/// A write that does not fit delivers the part that does, then fails with
/// [`OutputError::QuotaExceeded`]. The quota is never replenished, so every
/// later non-empty write fails without reaching the wrapped sink.
pub struct QuotaGuard {
    target: Arc<dyn TextSink>,
    limit: usize,
    state: Mutex<QuotaState>,
}

struct QuotaState {
    remaining: usize,
    reported: bool,
}

impl QuotaState {
    fn exceeded(&mut self, limit: usize) -> OutputError {
        if !self.reported {
            self.reported = true;
            warn!(limit, "output quota exceeded; truncating stream");
        }
        OutputError::QuotaExceeded { limit }
    }
}

impl QuotaGuard {
    pub fn new(target: Arc<dyn TextSink>, limit: usize) -> Result<Self, OutputError> {
        if limit == 0 {
            return Err(OutputError::InvalidQuota { quota: limit });
        }
        Ok(Self {
            target,
            limit,
            state: Mutex::new(QuotaState {
                remaining: limit,
                reported: false,
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        lock_state(&self.state).remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl TextSink for QuotaGuard {
    fn write_text(&self, chunk: &str) -> Result<(), OutputError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut state = lock_state(&self.state);
        if state.remaining == 0 {
            return Err(state.exceeded(self.limit));
        }

        let (end, requested) = prefix_of_chars(chunk, state.remaining);
        let written = requested.min(state.remaining);
        let too_big = requested > state.remaining;

        self.target.write_text(&chunk[..end])?;
        state.remaining -= written;

        if too_big {
            return Err(state.exceeded(self.limit));
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        self.target.flush()
    }

    fn close(&self) -> Result<(), OutputError> {
        self.target.close()
    }
}

impl fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("limit", &self.limit)
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target.captured_text() {
            Some(text) => f.write_str(&text),
            None => Ok(()),
        }
    }
}

/// Returns the byte length of the first `max_chars` chars of `text` together
/// with the total number of chars requested, counting no further than one
/// past the cut.
fn prefix_of_chars(text: &str, max_chars: usize) -> (usize, usize) {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => (end, max_chars + 1),
        None => (text.len(), text.chars().count()),
    }
}
