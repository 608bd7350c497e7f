//! Growable byte accumulator fed by raw transport reads.
//!
//! No framing logic lives here: bytes are appended at the back and consumed from
//! the front. Consumed space is reclaimed lazily so that consuming one byte at a
//! time during resynchronization stays O(1) amortized.

/// Consumed prefix size after which the backing storage is compacted.
const COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, Default, Clone)]
pub struct ByteRingBuffer {
    data: Vec<u8>,
    start: usize,
}

impl ByteRingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Unconsumed bytes, oldest first.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `n` bytes from the front (clamped to what is buffered).
    pub fn consume(&mut self, n: usize) {
        self.start += n.min(self.len());
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start >= COMPACT_THRESHOLD && self.start * 2 >= self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    /// Remove and return everything still buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        let rest = self.as_slice().to_vec();
        self.clear();
        rest
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }
}
