//! A byte buffer with reserved head/tail padding, so that wrapping a payload
//! in a crypto header or a wire frame doesn't require a copy of the payload
//! itself.
//!
//! `prepend`/`append` carve into the padding already allocated; once a side
//! runs out of padding the buffer reallocates, doubling the padding on that
//! side. `SecureFlexBuffer` is the same layout but zeroes its storage on
//! drop.

const DEFAULT_PAD: usize = 32;
const DEFAULT_ALLOC: usize = 1024;

/// A contiguous byte region with head-padding, payload, and tail-padding.
#[derive(Clone)]
pub struct FlexBuffer {
    buffer: Vec<u8>,
    /// Offset of the payload's first byte within `buffer`.
    head: usize,
    /// Length of the payload.
    len: usize,
}

impl FlexBuffer {
    /// An empty buffer with the default head/tail padding preallocated.
    pub fn new() -> Self {
        Self::with_padding(&[], DEFAULT_PAD, DEFAULT_PAD)
    }

    /// A buffer whose payload is `data`, with `hpad`/`tpad` bytes of
    /// reserved padding on each side.
    pub fn with_padding(data: &[u8], hpad: usize, tpad: usize) -> Self {
        let alloc = (hpad + data.len() + tpad).max(DEFAULT_ALLOC);
        let mut buffer = vec![0u8; alloc];
        buffer[hpad..hpad + data.len()].copy_from_slice(data);
        Self {
            buffer,
            head: hpad,
            len: data.len(),
        }
    }

    /// The payload.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.head..self.head + self.len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.head..self.head + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of head padding currently free.
    pub fn head_room(&self) -> usize {
        self.head
    }

    /// Bytes of tail padding currently free.
    pub fn tail_room(&self) -> usize {
        self.buffer.len() - self.head - self.len
    }

    /// Zero every byte in the allocation, including padding.
    pub fn burn(&mut self) {
        self.buffer.iter_mut().for_each(|b| *b = 0);
    }

    /// Grow the preallocation so at least `min_head`/`min_tail` bytes of
    /// padding surround the payload. Never shrinks.
    pub fn reserve(&mut self, min_head: usize, min_tail: usize) {
        if self.head >= min_head && self.tail_room() >= min_tail {
            return;
        }
        let new_head = min_head.max(self.head);
        let new_alloc = new_head + self.len + min_tail.max(self.tail_room());
        let mut buffer = vec![0u8; new_alloc];
        buffer[new_head..new_head + self.len].copy_from_slice(self.payload());
        self.buffer = buffer;
        self.head = new_head;
    }

    /// Prepend `bytes` to the payload, growing into head padding or
    /// reallocating if none remains.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if self.head_room() < bytes.len() {
            self.reserve(bytes.len() + DEFAULT_PAD, self.tail_room());
        }
        self.head -= bytes.len();
        self.len += bytes.len();
        self.buffer[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    /// Append `bytes` to the payload, growing into tail padding or
    /// reallocating if none remains.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.tail_room() < bytes.len() {
            self.reserve(self.head, bytes.len() + DEFAULT_PAD);
        }
        let at = self.head + self.len;
        self.buffer[at..at + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Remove and return the first `n` bytes of the payload.
    pub fn pop_head(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.len, "pop_head past end of payload");
        let out = self.buffer[self.head..self.head + n].to_vec();
        self.head += n;
        self.len -= n;
        out
    }

    /// Remove and return the last `n` bytes of the payload.
    pub fn pop_tail(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.len, "pop_tail past end of payload");
        let at = self.head + self.len - n;
        let out = self.buffer[at..at + n].to_vec();
        self.len -= n;
        out
    }

    // Typed helpers in host byte order, composing to form the RPC codec.

    pub fn push_u32(&mut self, v: u32) {
        self.append(&v.to_ne_bytes());
    }

    pub fn push_u64(&mut self, v: u64) {
        self.append(&v.to_ne_bytes());
    }

    pub fn pop_u32_front(&mut self) -> u32 {
        let b = self.pop_head(4);
        u32::from_ne_bytes(b.try_into().unwrap())
    }

    pub fn pop_u64_front(&mut self) -> u64 {
        let b = self.pop_head(8);
        u64::from_ne_bytes(b.try_into().unwrap())
    }
}

impl Default for FlexBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`FlexBuffer`] that zeroes its backing storage when dropped, for
/// buffers that have carried key material or plaintext.
pub struct SecureFlexBuffer(FlexBuffer);

impl SecureFlexBuffer {
    pub fn new() -> Self {
        Self(FlexBuffer::new())
    }

    pub fn with_padding(data: &[u8], hpad: usize, tpad: usize) -> Self {
        Self(FlexBuffer::with_padding(data, hpad, tpad))
    }

    pub fn inner(&self) -> &FlexBuffer {
        &self.0
    }

    pub fn inner_mut(&mut self) -> &mut FlexBuffer {
        &mut self.0
    }
}

impl Default for SecureFlexBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecureFlexBuffer {
    fn drop(&mut self) {
        self.0.burn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_append_in_place() {
        let mut buf = FlexBuffer::with_padding(b"hello", 16, 16);
        buf.prepend(b"HDR:");
        buf.append(b":TRL");
        assert_eq!(buf.payload(), b"HDR:hello:TRL");
    }

    #[test]
    fn prepend_reallocates_when_padding_exhausted() {
        let mut buf = FlexBuffer::with_padding(b"x", 2, 2);
        buf.prepend(&[1, 2, 3, 4, 5]);
        assert_eq!(&buf.payload()[5..], b"x");
        assert_eq!(buf.payload().len(), 6);
    }

    #[test]
    fn pop_head_and_tail_roundtrip() {
        let mut buf = FlexBuffer::with_padding(b"abcdef", 8, 8);
        assert_eq!(buf.pop_head(2), b"ab");
        assert_eq!(buf.pop_tail(2), b"ef");
        assert_eq!(buf.payload(), b"cd");
    }

    #[test]
    fn burn_zeroes_everything() {
        let mut buf = FlexBuffer::with_padding(b"secret", 4, 4);
        buf.burn();
        assert!(buf.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn typed_push_pop_roundtrip() {
        let mut buf = FlexBuffer::new();
        buf.push_u32(42);
        buf.push_u64(0xdead_beef_cafe_babe);
        assert_eq!(buf.pop_u32_front(), 42);
        assert_eq!(buf.pop_u64_front(), 0xdead_beef_cafe_babe);
    }
}
