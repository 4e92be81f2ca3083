//! Output endpoints an evaluation writes through.
//!
//! Text sinks ([`TextSink`]) take UTF-8 chunks and are what ultimately reach
//! the network layer. Byte sinks ([`ByteSink`]) sit in front of them and
//! receive whatever the evaluation prints, in whatever chunking it prints it.
//! Every sink is shared behind an `Arc` and serializes its callers with its
//! own lock.

mod callback;
mod line_buffer;
mod quota;
mod tee;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub use callback::CallbackSink;
pub use callback::OutputHandler;
pub use line_buffer::LineBufferedSink;
pub use quota::QuotaGuard;
pub use tee::TeeSink;

use crate::error::OutputError;

pub trait TextSink: Send + Sync {
    fn write_text(&self, chunk: &str) -> Result<(), OutputError>;

    fn write_char(&self, c: char) -> Result<(), OutputError> {
        let mut buf = [0u8; 4];
        self.write_text(c.encode_utf8(&mut buf))
    }

    fn write_chars(&self, chars: &[char]) -> Result<(), OutputError> {
        if chars.is_empty() {
            return Ok(());
        }
        let chunk: String = chars.iter().collect();
        self.write_text(&chunk)
    }

    fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.flush()
    }

    /// Text retained by the sink, for sinks that retain any.
    fn captured_text(&self) -> Option<String> {
        None
    }
}

pub trait ByteSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError>;

    fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.flush()
    }
}

/// Locks a sink's state, recovering it if a previous holder unwound. A
/// forced termination can unwind an evaluation mid-write; the stream must
/// remain usable for whoever reports that.
pub(crate) fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `std::io::Write` front for a [`ByteSink`], so evaluation code can use
/// `write!` and friends. Sink errors are carried inside the `io::Error` and
/// can be recovered with [`OutputError::from_io`].
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn ByteSink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn ByteSink>) -> Self {
        Self { sink }
    }

    pub fn close(&self) -> Result<(), OutputError> {
        self.sink.close()
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

impl fmt::Debug for SinkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkWriter").finish_non_exhaustive()
    }
}

/// In-memory byte sink; the default second leg of a session's fan-out.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        lock_state(&self.bytes).clone()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&lock_state(&self.bytes)).into_owned()
    }

    pub fn len(&self) -> usize {
        lock_state(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteSink for CaptureBuffer {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError> {
        lock_state(&self.bytes).extend_from_slice(bytes);
        Ok(())
    }
}

impl TextSink for CaptureBuffer {
    fn write_text(&self, chunk: &str) -> Result<(), OutputError> {
        self.write_bytes(chunk.as_bytes())
    }

    fn captured_text(&self) -> Option<String> {
        Some(self.contents_lossy())
    }
}

impl fmt::Display for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contents_lossy())
    }
}

/// Adapts any `std::io::Write` (the server's own stdout, a log file) into a
/// [`ByteSink`]. Every write is flushed through so mirrored output is not
/// held back behind the writer's own buffer.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: io::Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: io::Write + Send> ByteSink for WriterSink<W> {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut writer = lock_state(&self.writer);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        lock_state(&self.writer).flush()?;
        Ok(())
    }
}
