use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use super::ByteSink;
use super::TextSink;
use super::lock_state;
use crate::error::OutputError;

/// Longest prefix of a UTF-8 sequence that can still be waiting for its
/// continuation bytes.
const MAX_INCOMPLETE_UTF8: usize = 3;

/// Accumulates bytes and hands complete lines to the wrapped text sink, so a
/// chatty evaluation produces one network message per line instead of one
/// per `write` call.
///
/// Content without a newline is released anyway once `capacity` bytes are
/// pending, so memory stays bounded. A forced release never splits a UTF-8
/// sequence: up to three trailing bytes of an unfinished char are carried
/// into the next write, even when that takes the buffer past a capacity
/// smaller than the char. `close` releases everything, decoding lossily if
/// the stream ended mid-char.
pub struct LineBufferedSink {
    target: Arc<dyn TextSink>,
    capacity: usize,
    state: Mutex<LineBufferState>,
}

#[derive(Default)]
struct LineBufferState {
    pending: Vec<u8>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Release through the last newline, or everything once full.
    Lines,
    /// Release everything that decodes.
    Flush,
    /// Release everything.
    Close,
}

impl LineBufferedSink {
    pub fn new(target: Arc<dyn TextSink>, capacity: usize) -> Result<Self, OutputError> {
        if capacity == 0 {
            return Err(OutputError::InvalidCapacity { capacity });
        }
        Ok(Self {
            target,
            capacity,
            state: Mutex::new(LineBufferState {
                pending: Vec::with_capacity(capacity + MAX_INCOMPLETE_UTF8),
                closed: false,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        lock_state(&self.state).pending.len()
    }

    pub fn write_byte(&self, byte: u8) -> Result<(), OutputError> {
        self.write_bytes(&[byte])
    }

    fn release(&self, state: &mut LineBufferState, mode: Release) -> Result<(), OutputError> {
        let len = state.pending.len();
        if len == 0 {
            return Ok(());
        }
        let forced = mode != Release::Lines || len >= self.capacity;
        let cut = if forced {
            len
        } else {
            match state.pending.iter().rposition(|b| *b == b'\n') {
                Some(idx) => idx + 1,
                None => return Ok(()),
            }
        };

        let consumed = self.decodable_prefix(&state.pending[..cut], mode);
        if consumed == 0 {
            return Ok(());
        }
        // Take the chunk out before handing it on: if the target fails part
        // way (quota, closed peer) the same bytes must not be offered twice.
        let chunk: Vec<u8> = state.pending.drain(..consumed).collect();
        let text = match std::str::from_utf8(&chunk) {
            Ok(text) => Cow::Borrowed(text),
            Err(_) => String::from_utf8_lossy(&chunk),
        };
        debug!(bytes = consumed, forced, "releasing buffered output");
        self.target.write_text(&text)
    }

    /// Number of leading bytes of `slice` to release now.
    fn decodable_prefix(&self, slice: &[u8], mode: Release) -> usize {
        let err = match std::str::from_utf8(slice) {
            Ok(_) => return slice.len(),
            Err(err) => err,
        };
        let held = slice.len() - err.valid_up_to();
        let incomplete_tail = err.error_len().is_none();
        if mode != Release::Close && incomplete_tail && held <= MAX_INCOMPLETE_UTF8 {
            err.valid_up_to()
        } else {
            slice.len()
        }
    }
}

impl fmt::Debug for LineBufferedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBufferedSink")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl ByteSink for LineBufferedSink {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), OutputError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut state = lock_state(&self.state);
        if state.closed {
            return Err(OutputError::Closed);
        }
        let mut rest = bytes;
        while !rest.is_empty() {
            // A full buffer can only be holding an unfinished char; feed it
            // one byte at a time until the char completes.
            let room = self
                .capacity
                .saturating_sub(state.pending.len())
                .max(1);
            let (head, tail) = rest.split_at(room.min(rest.len()));
            state.pending.extend_from_slice(head);
            self.release(&mut state, Release::Lines)?;
            rest = tail;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        let mut state = lock_state(&self.state);
        if state.closed {
            return Ok(());
        }
        self.release(&mut state, Release::Flush)?;
        self.target.flush()
    }

    fn close(&self) -> Result<(), OutputError> {
        let mut state = lock_state(&self.state);
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let released = self.release(&mut state, Release::Close);
        let closed = self.target.close();
        released.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CallbackSink;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn buffered(capacity: usize) -> (LineBufferedSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = CallbackSink::from_fn({
            let seen = Arc::clone(&seen);
            move |chunk: &str| seen.lock().expect("lock").push(chunk.to_string())
        });
        let buffered = LineBufferedSink::new(Arc::new(sink), capacity).expect("line buffer");
        (buffered, seen)
    }

    fn chunks(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        seen.lock().expect("lock").clone()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let sink: Arc<dyn TextSink> = Arc::new(CallbackSink::from_fn(|_: &str| {}));
        assert_matches!(
            LineBufferedSink::new(sink, 0),
            Err(OutputError::InvalidCapacity { capacity: 0 })
        );
    }

    #[test]
    fn releases_complete_lines_and_holds_the_rest() {
        let (sink, seen) = buffered(8);
        sink.write_bytes(b"ab").expect("write");
        assert!(chunks(&seen).is_empty());
        sink.write_bytes(b"cd\n").expect("write");
        assert_eq!(chunks(&seen), vec!["abcd\n"]);
        sink.write_bytes(b"ef").expect("write");
        assert_eq!(chunks(&seen), vec!["abcd\n"]);
        ByteSink::flush(&sink).expect("flush");
        assert_eq!(chunks(&seen), vec!["abcd\n", "ef"]);
    }

    #[test]
    fn residue_after_last_newline_is_kept() {
        let (sink, seen) = buffered(64);
        sink.write_bytes(b"one\ntwo\nthr").expect("write");
        assert_eq!(chunks(&seen), vec!["one\ntwo\n"]);
        assert_eq!(sink.pending_len(), 3);
        sink.write_bytes(b"ee\n").expect("write");
        assert_eq!(chunks(&seen), vec!["one\ntwo\n", "three\n"]);
    }

    #[test]
    fn full_buffer_without_newline_is_released_whole() {
        let (sink, seen) = buffered(4);
        sink.write_bytes(b"abcdefghij").expect("write");
        assert_eq!(chunks(&seen), vec!["abcd", "efgh"]);
        ByteSink::close(&sink).expect("close");
        assert_eq!(chunks(&seen), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn single_byte_writes_release_on_newline() {
        let (sink, seen) = buffered(16);
        for byte in b"hi\nyo" {
            sink.write_byte(*byte).expect("byte");
        }
        assert_eq!(chunks(&seen), vec!["hi\n"]);
        assert_eq!(sink.pending_len(), 2);
    }

    #[test]
    fn forced_release_does_not_split_multibyte_chars() {
        let (sink, seen) = buffered(4);
        // "aé" is 3 bytes; the next 'é' straddles the capacity boundary.
        sink.write_bytes("aéé".as_bytes()).expect("write");
        assert_eq!(chunks(&seen), vec!["aé"]);
        assert_eq!(sink.pending_len(), 2);
        ByteSink::flush(&sink).expect("flush");
        assert_eq!(chunks(&seen), vec!["aé", "é"]);
    }

    #[test]
    fn flush_keeps_an_unfinished_char_and_close_releases_it_lossily() {
        let (sink, seen) = buffered(16);
        let bytes = "ok€".as_bytes();
        sink.write_bytes(&bytes[..bytes.len() - 1]).expect("write");
        ByteSink::flush(&sink).expect("flush");
        assert_eq!(chunks(&seen), vec!["ok"]);
        ByteSink::close(&sink).expect("close");
        assert_eq!(chunks(&seen), vec!["ok", "\u{FFFD}"]);
    }

    #[test]
    fn writes_after_close_fail() {
        let (sink, _seen) = buffered(8);
        ByteSink::close(&sink).expect("close");
        assert_matches!(sink.write_bytes(b"late"), Err(OutputError::Closed));
        ByteSink::close(&sink).expect("second close is a no-op");
    }

    #[test]
    fn arbitrary_chunking_round_trips_byte_exact() {
        let text = "fn main() {\n    println!(\"héllo wörld\");\n}\n日本語のテキスト\nno newline at end €";
        let bytes = text.as_bytes();
        for capacity in 4..=24 {
            for chunk_len in 1..=9 {
                let (sink, seen) = buffered(capacity);
                for chunk in bytes.chunks(chunk_len) {
                    sink.write_bytes(chunk).expect("write");
                }
                ByteSink::close(&sink).expect("close");
                let released = chunks(&seen);
                assert_eq!(
                    released.concat(),
                    text,
                    "capacity={capacity} chunk_len={chunk_len}"
                );
                assert!(released.iter().all(|chunk| chunk.len() <= capacity));
            }
        }
    }

    #[test]
    fn capacity_below_char_width_still_round_trips() {
        let text = "é\n€ and 𝄞 mixed with ascii\n日本";
        let bytes = text.as_bytes();
        for capacity in 1..=3 {
            for chunk_len in 1..=5 {
                let (sink, seen) = buffered(capacity);
                for chunk in bytes.chunks(chunk_len) {
                    sink.write_bytes(chunk).expect("write");
                }
                ByteSink::close(&sink).expect("close");
                let released = chunks(&seen);
                assert_eq!(
                    released.concat(),
                    text,
                    "capacity={capacity} chunk_len={chunk_len}"
                );
                assert!(released.iter().all(|chunk| !chunk.contains('\u{FFFD}')));
            }
        }
    }

    #[test]
    fn single_byte_capacity_releases_whole_chars() {
        let (sink, seen) = buffered(1);
        sink.write_bytes("é\n".as_bytes()).expect("write");
        ByteSink::close(&sink).expect("close");
        assert_eq!(chunks(&seen), vec!["é", "\n"]);
    }

    #[test]
    fn releases_end_on_newlines_when_lines_fit() {
        let text = "alpha\nbeta\ngamma\ndelta\nepsilon";
        for chunk_len in 1..=text.len() {
            let (sink, seen) = buffered(32);
            for chunk in text.as_bytes().chunks(chunk_len) {
                sink.write_bytes(chunk).expect("write");
            }
            ByteSink::close(&sink).expect("close");
            let released = chunks(&seen);
            let (last, rest) = released.split_last().expect("at least one release");
            assert!(rest.iter().all(|chunk| chunk.ends_with('\n')));
            assert_eq!(last.as_str(), "epsilon");
            assert_eq!(released.concat(), text);
        }
    }
}
