//! Fixed-capacity byte ring buffer
//!
//! Keeps only the newest `capacity` bytes written to it. Older bytes are
//! overwritten in FIFO order, so memory use never exceeds the capacity no
//! matter how much output flows through.

/// Ring buffer retaining the most recent bytes
#[derive(Debug)]
pub struct RingBuffer {
    /// Backing storage, allocated on first write
    data: Vec<u8>,
    capacity: usize,
    /// Index of the oldest byte
    start: usize,
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `bytes`, discarding the oldest contents to make room
    pub fn write(&mut self, bytes: &[u8]) {
        if self.capacity == 0 || bytes.is_empty() {
            return;
        }
        if self.data.is_empty() {
            self.data = vec![0; self.capacity];
        }

        // Only the tail of an oversized write can survive
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let end = (self.start + self.len) % self.capacity;
        let first = bytes.len().min(self.capacity - end);
        self.data[end..end + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);

        let overflow = (self.len + bytes.len()).saturating_sub(self.capacity);
        self.start = (self.start + overflow) % self.capacity;
        self.len = (self.len + bytes.len()).min(self.capacity);
    }

    /// Current contents, oldest to newest
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }

        let head = self.len.min(self.capacity - self.start);
        out.extend_from_slice(&self.data[self.start..self.start + head]);
        out.extend_from_slice(&self.data[..self.len - head]);
        out
    }

    /// Drop all contents, keeping the allocation
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}
