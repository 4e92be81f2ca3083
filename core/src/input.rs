//! Input for an evaluation that reads from its session.
//!
//! The protocol layer pushes text into an [`InputSender`] as input messages
//! arrive; the evaluation pulls it out of the matching [`InputReader`]. When
//! the evaluation reads from an empty queue the channel calls its request
//! handler, so the client can be prompted, then blocks until something is
//! sent, end-of-stream is sent, or either side closes the channel.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::InputError;
use crate::interrupt::InterruptHandle;
use crate::sink::lock_state;

/// How often a blocked reader re-checks its session's interrupt state.
const INTERRUPT_POLL: Duration = Duration::from_millis(25);

/// Called when a reader finds the queue empty and is about to block.
pub type InputRequestHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputItem {
    Char(char),
    EndOfStream,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<InputItem>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    fn push(&self, items: impl IntoIterator<Item = InputItem>) -> Result<(), InputError> {
        let mut state = lock_state(&self.state);
        if state.closed {
            return Err(InputError::Closed);
        }
        state.items.extend(items);
        self.ready.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut state = lock_state(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.items.len();
        state.items.clear();
        self.ready.notify_all();
        debug!(dropped, "input channel closed");
    }
}

/// Builder for a connected [`InputSender`]/[`InputReader`] pair.
pub struct InputChannel {
    interrupt: InterruptHandle,
    on_request: Option<InputRequestHandler>,
}

impl InputChannel {
    /// `interrupt` is the handle of the session whose evaluation will read.
    pub fn new(interrupt: InterruptHandle) -> Self {
        Self {
            interrupt,
            on_request: None,
        }
    }

    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_request = Some(Arc::new(handler));
        self
    }

    pub fn split(self) -> (InputSender, InputReader) {
        let shared = Arc::new(Shared::default());
        (
            InputSender {
                shared: Arc::clone(&shared),
            },
            InputReader {
                shared,
                interrupt: self.interrupt,
                on_request: self.on_request,
                spill: Vec::new(),
            },
        )
    }
}

/// Producer half. Cloneable; every clone feeds the same queue.
#[derive(Clone)]
pub struct InputSender {
    shared: Arc<Shared>,
}

impl InputSender {
    pub fn send_text(&self, text: &str) -> Result<(), InputError> {
        self.shared.push(text.chars().map(InputItem::Char))
    }

    pub fn send_char(&self, c: char) -> Result<(), InputError> {
        self.shared.push([InputItem::Char(c)])
    }

    /// Queues an end-of-stream marker. Reads return `None` once they reach
    /// it; text sent afterwards is read normally.
    pub fn send_eof(&self) -> Result<(), InputError> {
        self.shared.push([InputItem::EndOfStream])
    }

    /// Discards queued input and ends the stream for good.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        lock_state(&self.shared.state).closed
    }
}

impl fmt::Debug for InputSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer half, owned by the evaluation.
pub struct InputReader {
    shared: Arc<Shared>,
    interrupt: InterruptHandle,
    on_request: Option<InputRequestHandler>,
    /// Encoded bytes of a char that did not fit the caller's `io::Read`
    /// buffer.
    spill: Vec<u8>,
}

impl InputReader {
    /// Reads at least one char into `buf`, blocking while the queue is
    /// empty, then takes whatever else is already queued. Returns `None` at
    /// end of stream.
    ///
    /// While blocked, a cooperative interrupt returns
    /// [`InputError::Interrupted`] and a forced stop unwinds the caller.
    pub fn read(&self, buf: &mut [char]) -> Result<Option<usize>, InputError> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let mut state = lock_state(&self.shared.state);
        let mut requested = false;
        let first = loop {
            match state.items.pop_front() {
                Some(InputItem::Char(c)) => break c,
                Some(InputItem::EndOfStream) => return Ok(None),
                None => {}
            }
            if state.closed {
                return Ok(None);
            }
            if !requested {
                requested = true;
                if let Some(handler) = &self.on_request {
                    drop(state);
                    handler();
                    state = lock_state(&self.shared.state);
                    continue;
                }
            }
            if self.interrupt.is_interrupted() {
                drop(state);
                self.interrupt.checkpoint()?;
                state = lock_state(&self.shared.state);
                continue;
            }
            state = self
                .shared
                .ready
                .wait_timeout(state, INTERRUPT_POLL)
                .map(|(state, _)| state)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        };

        buf[0] = first;
        let mut filled = 1;
        while filled < buf.len() {
            // End-of-stream stays queued so the chars read so far are kept.
            let Some(InputItem::Char(c)) = state.items.front().copied() else {
                break;
            };
            state.items.pop_front();
            buf[filled] = c;
            filled += 1;
        }
        Ok(Some(filled))
    }

    pub fn read_char(&self) -> Result<Option<char>, InputError> {
        let mut buf = ['\0'];
        Ok(self.read(&mut buf)?.map(|_| buf[0]))
    }

    /// Reads through the next `\n` (kept in the result). Returns `None` only
    /// when the stream ends before any char was read.
    pub fn read_line(&self) -> Result<Option<String>, InputError> {
        let mut line = String::new();
        while let Some(c) = self.read_char()? {
            line.push(c);
            if c == '\n' {
                return Ok(Some(line));
            }
        }
        Ok((!line.is_empty()).then_some(line))
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }
}

/// UTF-8 view of the stream. `Ok(0)` is end of stream.
impl io::Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.spill.is_empty() {
            let n = self.spill.len().min(buf.len());
            buf[..n].copy_from_slice(&self.spill[..n]);
            self.spill.drain(..n);
            return Ok(n);
        }

        let mut chars = vec!['\0'; (buf.len() / 4).max(1)];
        let Some(count) = InputReader::read(self, &mut chars)? else {
            return Ok(0);
        };
        let mut written = 0;
        let mut encoded = [0u8; 4];
        for c in &chars[..count] {
            let bytes = c.encode_utf8(&mut encoded).as_bytes();
            let fit = bytes.len().min(buf.len() - written);
            buf[written..written + fit].copy_from_slice(&bytes[..fit]);
            written += fit;
            self.spill.extend_from_slice(&bytes[fit..]);
        }
        Ok(written)
    }
}

impl fmt::Debug for InputReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputReader")
            .field("interrupt", &self.interrupt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::TerminationSignal;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::panic;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn channel() -> (InputSender, InputReader) {
        InputChannel::new(InterruptHandle::new()).split()
    }

    fn read_string(reader: &InputReader, len: usize) -> Option<String> {
        let mut buf = vec!['\0'; len];
        let n = reader.read(&mut buf).expect("read")?;
        Some(buf[..n].iter().collect())
    }

    #[test]
    fn drains_up_to_buffer_length() {
        let (tx, rx) = channel();
        tx.send_text("hello").expect("send");
        assert_eq!(read_string(&rx, 3).as_deref(), Some("hel"));
        assert_eq!(read_string(&rx, 8).as_deref(), Some("lo"));
        assert_eq!(rx.read(&mut []).expect("empty read"), Some(0));
    }

    #[test]
    fn end_of_stream_after_chars_is_deferred_to_next_read() {
        let (tx, rx) = channel();
        tx.send_text("ab").expect("send");
        tx.send_eof().expect("eof");
        tx.send_text("c").expect("send");
        assert_eq!(read_string(&rx, 10).as_deref(), Some("ab"));
        assert_eq!(read_string(&rx, 10), None);
        assert_eq!(read_string(&rx, 10).as_deref(), Some("c"));
    }

    #[test]
    fn request_handler_runs_outside_the_lock() {
        let (tx, rx) = InputChannel::new(InterruptHandle::new()).split();
        let requests = Arc::new(AtomicUsize::new(0));
        let rx = InputReader {
            on_request: Some(Arc::new({
                let tx = tx.clone();
                let requests = Arc::clone(&requests);
                move || {
                    requests.fetch_add(1, Ordering::SeqCst);
                    tx.send_text("42\n").expect("send from handler");
                }
            })),
            ..rx
        };
        assert_eq!(rx.read_line().expect("line").as_deref(), Some("42\n"));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_wakes_a_blocked_reader() {
        let (tx, rx) = channel();
        let reader = thread::spawn(move || read_string(&rx, 4));
        thread::sleep(Duration::from_millis(50));
        tx.close();
        assert_eq!(reader.join().expect("join"), None);
        assert_matches!(tx.send_text("late"), Err(InputError::Closed));
    }

    #[test]
    fn close_discards_queued_input() {
        let (tx, rx) = channel();
        tx.send_text("unread").expect("send");
        rx.close();
        assert!(tx.is_closed());
        assert_eq!(read_string(&rx, 8), None);
    }

    #[test]
    fn interrupt_wakes_a_blocked_reader() {
        let interrupt = InterruptHandle::new();
        let (_tx, rx) = InputChannel::new(interrupt.clone()).split();
        let reader = thread::spawn(move || rx.read_char());
        thread::sleep(Duration::from_millis(50));
        interrupt.request_interrupt();
        assert_matches!(reader.join().expect("join"), Err(InputError::Interrupted));
    }

    #[test]
    fn forced_stop_unwinds_a_blocked_reader() {
        let interrupt = InterruptHandle::new();
        let (_tx, rx) = InputChannel::new(interrupt.clone()).split();
        let reader = thread::spawn(move || {
            panic::catch_unwind(AssertUnwindSafe(|| rx.read_char()))
                .map_err(|payload| TerminationSignal::is_payload(payload.as_ref()))
        });
        thread::sleep(Duration::from_millis(50));
        interrupt.request_stop();
        assert_matches!(reader.join().expect("join"), Err(true));
    }

    #[test]
    fn io_read_yields_utf8_and_zero_at_end() {
        let (tx, mut rx) = channel();
        tx.send_text("naïve 日本\n").expect("send");
        tx.send_eof().expect("eof");
        let mut text = String::new();
        rx.read_to_string(&mut text).expect("read_to_string");
        assert_eq!(text, "naïve 日本\n");
    }

    #[test]
    fn io_read_spills_chars_wider_than_the_buffer() {
        let (tx, mut rx) = channel();
        tx.send_text("€").expect("send");
        let mut byte = [0u8; 1];
        let mut collected = Vec::new();
        for _ in 0..3 {
            assert_eq!(Read::read(&mut rx, &mut byte).expect("read"), 1);
            collected.push(byte[0]);
        }
        assert_eq!(String::from_utf8(collected).expect("utf8"), "€");
    }

    #[test]
    fn read_line_returns_partial_line_at_end() {
        let (tx, rx) = channel();
        tx.send_text("first\nsecond").expect("send");
        tx.send_eof().expect("eof");
        tx.send_eof().expect("eof");
        assert_eq!(rx.read_line().expect("line").as_deref(), Some("first\n"));
        assert_eq!(rx.read_line().expect("line").as_deref(), Some("second"));
        assert_eq!(rx.read_line().expect("line"), None);
    }
}
