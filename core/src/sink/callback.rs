use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use super::ByteSink;
use super::TextSink;
use crate::error::OutputError;

/// Receives every chunk of text that leaves a session's output pipeline.
pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Leaf sink: hands each non-empty chunk to the registered handler, once,
/// synchronously with the write. Nothing is buffered.
pub struct CallbackSink {
    handler: OutputHandler,
    closed: AtomicBool,
}

impl CallbackSink {
    pub fn new(handler: OutputHandler) -> Self {
        Self {
            handler,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::new(Arc::new(handler))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TextSink for CallbackSink {
    fn write_text(&self, chunk: &str) -> Result<(), OutputError> {
        if self.is_closed() {
            return Err(OutputError::Closed);
        }
        if !chunk.is_empty() {
            (self.handler)(chunk);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ByteSink for CallbackSink {
    /// Byte writes are decoded lossily. Callers that may split multi-byte
    /// sequences across writes should go through a
    /// [`super::LineBufferedSink`], which reassembles them first.
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError> {
        self.write_text(&String::from_utf8_lossy(bytes))
    }

    fn close(&self) -> Result<(), OutputError> {
        TextSink::close(self)
    }
}

impl fmt::Write for CallbackSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_text(s).map_err(|_| fmt::Error)
    }
}

/// The sink keeps nothing, so it always renders as empty.
impl fmt::Display for CallbackSink {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::fmt::Write as _;
    use std::sync::Mutex;

    fn recording_sink() -> (CallbackSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = CallbackSink::from_fn({
            let seen = Arc::clone(&seen);
            move |chunk: &str| seen.lock().expect("lock").push(chunk.to_string())
        });
        (sink, seen)
    }

    #[test]
    fn forwards_each_non_empty_write_once() {
        let (sink, seen) = recording_sink();
        sink.write_text("alpha").expect("write");
        sink.write_text("").expect("empty write");
        sink.write_text("beta").expect("write");
        assert_eq!(*seen.lock().expect("lock"), vec!["alpha", "beta"]);
    }

    #[test]
    fn char_and_byte_variants_normalize_to_single_chunks() {
        let (mut sink, seen) = recording_sink();
        sink.write_chars(&['h', 'e', 'y', '!'][..3]).expect("partial chars");
        TextSink::write_char(&sink, 'é').expect("char");
        sink.write_bytes("naïve".as_bytes()).expect("bytes");
        sink.write_bytes(&[]).expect("no bytes");
        sink.write_str("tail").expect("fmt");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["hey", "é", "naïve", "tail"]
        );
    }

    #[test]
    fn writes_after_close_fail() {
        let (sink, seen) = recording_sink();
        TextSink::close(&sink).expect("close");
        assert_matches!(sink.write_text("late"), Err(OutputError::Closed));
        assert!(seen.lock().expect("lock").is_empty());
    }
}
