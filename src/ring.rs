//! Fixed-capacity byte ring
//!
//! All wraparound arithmetic lives here. Producers fill the contiguous free
//! span returned by [`RingBuffer::write_span`] and then [`RingBuffer::commit`]
//! what they wrote; consumers read [`RingBuffer::read_span`] or copy across the
//! wrap with [`RingBuffer::peek_into`], then [`RingBuffer::pop`].

#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Oldest byte
    head: usize,
    /// Bytes stored
    len: usize,
}

impl RingBuffer {
    /// Creates an empty ring holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free bytes in total, possibly split across the physical end
    pub fn vacancy(&self) -> usize {
        self.capacity() - self.len
    }

    fn tail(&self) -> usize {
        match self.capacity() {
            0 => 0,
            cap => (self.head + self.len) % cap,
        }
    }

    /// Largest contiguous free region, starting right after the newest byte
    ///
    /// Empty when the ring is full. When the free space wraps, only the part
    /// up to the physical end is returned; the rest becomes available after
    /// the next commit.
    pub fn write_span(&mut self) -> &mut [u8] {
        let tail = self.tail();
        let contiguous = (self.capacity() - tail).min(self.vacancy());
        &mut self.buf[tail..tail + contiguous]
    }

    /// Marks `n` bytes of the last write span as filled
    ///
    /// Returns the number actually committed, which is `n` clamped to the
    /// vacancy.
    pub fn commit(&mut self, n: usize) -> usize {
        debug_assert!(n <= self.vacancy(), "commit past vacancy");
        let n = n.min(self.vacancy());
        self.len += n;
        n
    }

    /// Largest contiguous readable region, starting at the oldest byte
    pub fn read_span(&self) -> &[u8] {
        let contiguous = (self.capacity() - self.head).min(self.len);
        &self.buf[self.head..self.head + contiguous]
    }

    /// Discards up to `n` of the oldest bytes and returns how many were dropped
    pub fn pop(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n > 0 {
            self.head = (self.head + n) % self.capacity();
            self.len -= n;
        }
        n
    }

    /// Copies `out.len()` bytes starting `offset` bytes past the oldest one
    ///
    /// Returns false, leaving `out` untouched, if fewer bytes are stored.
    pub fn peek_into(&self, offset: usize, out: &mut [u8]) -> bool {
        if offset + out.len() > self.len {
            return false;
        }
        let cap = self.capacity();
        if out.is_empty() {
            return true;
        }
        let start = (self.head + offset) % cap;
        let first = (cap - start).min(out.len());
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.buf[..rest]);
        true
    }

    /// Appends all of `data` or nothing
    pub fn push_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.vacancy() {
            return false;
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let span = self.write_span();
            let n = span.len().min(remaining.len());
            span[..n].copy_from_slice(&remaining[..n]);
            self.commit(n);
            remaining = &remaining[n..];
        }
        true
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
