use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use super::ByteSink;
use super::TextSink;
use crate::error::OutputError;

/// Duplicates one stream into two sinks, `first` then `second`.
///
/// Two tees may feed each other (a session mirroring into another session's
/// stream that mirrors back). Re-entrant flushes of the same tee are
/// swallowed so such a cycle terminates.
pub struct TeeSink {
    first: Arc<dyn ByteSink>,
    second: Arc<dyn ByteSink>,
    flushing: AtomicBool,
}

impl TeeSink {
    pub fn new(first: Arc<dyn ByteSink>, second: Arc<dyn ByteSink>) -> Self {
        Self {
            first,
            second,
            flushing: AtomicBool::new(false),
        }
    }
}

/// Clears the in-progress flag on every exit path, including unwinds.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ByteSink for TeeSink {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError> {
        self.first.write_bytes(bytes)?;
        self.second.write_bytes(bytes)
    }

    fn flush(&self) -> Result<(), OutputError> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = FlushGuard(&self.flushing);
        self.first.flush()?;
        self.second.flush()
    }

    fn close(&self) -> Result<(), OutputError> {
        let first = self.first.close();
        let second = self.second.close();
        first.and(second)
    }
}

impl TextSink for TeeSink {
    fn write_text(&self, chunk: &str) -> Result<(), OutputError> {
        self.write_bytes(chunk.as_bytes())
    }

    fn flush(&self) -> Result<(), OutputError> {
        ByteSink::flush(self)
    }

    fn close(&self) -> Result<(), OutputError> {
        ByteSink::close(self)
    }
}
