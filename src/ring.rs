//! Growable circular byte buffer used to hold partially received frames

/// Byte ring with non-destructive peek and destructive read.
///
/// Writes never fail: when an append would overflow, the storage doubles
/// (or grows to fit, whichever is larger) and the live bytes are unwrapped
/// to the front of the new allocation.
pub struct RingBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer {
            buf: vec![0u8; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn write(&mut self, data: &[u8]) {
        if data.len() > self.free() {
            let needed = self.len + data.len();
            let mut capacity = self.capacity() * 2;
            while capacity < needed {
                capacity *= 2;
            }
            self.grow(capacity);
        }

        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
    }

    /// Copy up to `out.len()` buffered bytes into `out` without consuming them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        if n > first {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        n
    }

    /// Copy up to `out.len()` buffered bytes into `out` and consume them
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n);
        n
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
    }

    /// Drop everything buffered; capacity is kept
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn grow(&mut self, capacity: usize) {
        let mut next = vec![0u8; capacity];
        let n = self.peek(&mut next);
        debug_assert_eq!(n, self.len);
        self.buf = next;
        self.head = 0;
    }
}
