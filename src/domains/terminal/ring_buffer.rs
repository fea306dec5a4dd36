/// Bounded UTF-8 scrollback for one PTY session.
///
/// On overflow the front of the buffer is dropped at a newline boundary and
/// the remainder is prefixed with a full terminal reset so viewers repaint
/// from a clean screen. `seq` counts every character ever appended, letting
/// stream consumers discard tail events already covered by a snapshot.
pub const SOFT_CAP_CHARS: usize = 2_000_000;

/// RIS - reset to initial state.
pub const RESET_MARKER: &str = "\x1bc";

pub struct RingBuffer {
    data: String,
    cap: usize,
    seq: u64,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
            seq: 0,
        }
    }

    /// Appends a chunk and returns the sequence number after the append.
    pub fn append(&mut self, chunk: &str) -> u64 {
        self.data.push_str(chunk);
        self.seq += chunk.chars().count() as u64;
        if self.data.len() > self.cap {
            self.trim();
        }
        self.seq
    }

    /// Snapshot of the current scrollback and the sequence it covers.
    pub fn snapshot(&self) -> (String, u64) {
        (self.data.clone(), self.seq)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn trim(&mut self) {
        let overflow = self.data.len() - self.cap;
        let cut = match self.data[overflow..].find('\n') {
            Some(pos) => overflow + pos + 1,
            None => {
                // No newline to align on; fall back to the nearest char
                // boundary at or after the overflow point.
                let mut cut = overflow;
                while cut < self.data.len() && !self.data.is_char_boundary(cut) {
                    cut += 1;
                }
                cut
            }
        };
        let mut trimmed = String::with_capacity(self.data.len() - cut + RESET_MARKER.len());
        trimmed.push_str(RESET_MARKER);
        trimmed.push_str(&self.data[cut..]);
        self.data = trimmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_accumulate_and_advance_seq() {
        let mut buffer = RingBuffer::new(1024);
        assert_eq!(buffer.append("hello\n"), 6);
        assert_eq!(buffer.append("world\n"), 12);
        let (data, seq) = buffer.snapshot();
        assert_eq!(data, "hello\nworld\n");
        assert_eq!(seq, 12);
    }

    #[test]
    fn overflow_trims_at_newline_and_prefixes_reset() {
        let mut buffer = RingBuffer::new(16);
        buffer.append("first line\n");
        buffer.append("second line\n");
        let (data, _) = buffer.snapshot();
        assert!(data.starts_with(RESET_MARKER));
        assert!(data.ends_with("second line\n"));
        assert!(!data.contains("first line"));
    }

    #[test]
    fn overflow_without_newline_respects_char_boundaries() {
        let mut buffer = RingBuffer::new(8);
        buffer.append("éééééééééé");
        let (data, _) = buffer.snapshot();
        assert!(data.starts_with(RESET_MARKER));
        // Must still be valid UTF-8 ending in the tail of the input.
        assert!(data.trim_start_matches(RESET_MARKER).chars().all(|c| c == 'é'));
    }

    #[test]
    fn seq_keeps_counting_past_trims() {
        let mut buffer = RingBuffer::new(8);
        let mut last = 0;
        for _ in 0..100 {
            last = buffer.append("abcd\n");
        }
        assert_eq!(last, 500);
        assert!(buffer.len() <= 8 + RESET_MARKER.len() + 5);
    }
}
