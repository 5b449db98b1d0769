/// Fixed-capacity circular buffer holding the tail of a terminal's output.
///
/// The ring has `limit` slots and keeps one free so that a full ring can be
/// told apart from an empty one; at most `limit - 1` chars are retained.
/// Appending past capacity overwrites the oldest chars, never the newest.
///
/// Lengths and offsets count chars, so a client's offset always lands on a
/// character boundary.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    slots: Box<[char]>,
    head: usize,
    tail: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: vec!['\0'; limit.max(1)].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Build a buffer pre-filled with `text` (truncated to capacity).
    pub fn with_contents(limit: usize, text: &str) -> Self {
        let mut buffer = Self::new(limit);
        buffer.push_str(text);
        buffer
    }

    /// Maximum number of chars the buffer retains.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        let cap = self.slots.len();
        (self.tail + cap - self.head) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn push_str(&mut self, text: &str) {
        let retain = self.capacity();
        if retain == 0 || text.is_empty() {
            return;
        }
        // Chars that would be overwritten within this same write are skipped.
        let skip = text.chars().count().saturating_sub(retain);
        for ch in text.chars().skip(skip) {
            self.push_char(ch);
        }
    }

    fn push_char(&mut self, ch: char) {
        let cap = self.slots.len();
        self.slots[self.tail] = ch;
        self.tail = (self.tail + 1) % cap;
        if self.tail == self.head {
            self.head = (self.head + 1) % cap;
        }
    }

    /// Everything strictly after `offset`. An offset past the end (history
    /// the buffer never had, or lost) is clamped to 0: the whole buffer.
    pub fn since(&self, offset: usize) -> String {
        let len = self.len();
        let start = if offset > len { 0 } else { offset };
        let cap = self.slots.len();
        (start..len)
            .map(|i| self.slots[(self.head + i) % cap])
            .collect()
    }

    pub fn contents(&self) -> String {
        self.since(0)
    }
}

/// Incremental UTF-8 decoder for PTY reads.
///
/// A read may end in the middle of a multi-byte sequence; those bytes are
/// held back until the next read. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + bad;
                        }
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is held back (the stream ended mid-sequence).
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
