//! Fixed-capacity response accumulator.
//!
//! Filled segment by segment from the `recv` callback and finalized by the
//! orchestrator once the peer has closed the channel. The write offset always
//! stays strictly below capacity so one byte is left for the terminator.
//! A segment that would break that rule is dropped whole and not reported
//! to the caller.
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::stack::RecvChain;

/// Response capacity in bytes, terminator included.
pub const RESPONSE_CAPACITY: usize = 16 * 1024;

#[derive(Debug)]
pub struct ResponseBuffer {
    inner: Mutex<Inner>,
    complete: AtomicBool,
}

#[derive(Debug)]
struct Inner {
    data: Box<[u8]>,
    offset: usize,
    dropped: usize,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RESPONSE_CAPACITY)
    }

    /// # Panics
    /// Panics if `capacity` is zero; the terminator needs one byte.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "response buffer needs room for the terminator");
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                offset: 0,
                dropped: 0,
            }),
            complete: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Bytes accumulated so far.
    pub fn offset(&self) -> usize {
        self.inner.lock().offset
    }

    /// Bytes dropped because they did not fit.
    pub fn dropped(&self) -> usize {
        self.inner.lock().dropped
    }

    /// Copy `segment` in if the offset stays below capacity afterwards.
    pub fn append(&self, segment: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        inner.append(segment)
    }

    /// Append every segment of `chain` that fits; returns the bytes kept.
    pub fn append_chain(&self, chain: &RecvChain) -> usize {
        let mut inner = self.inner.lock();
        chain
            .segments()
            .filter(|segment| inner.append(segment))
            .map(<[u8]>::len)
            .sum()
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Write the terminator at the current offset and return the offset.
    pub fn finish(&self) -> usize {
        let mut inner = self.inner.lock();
        let offset = inner.offset;
        inner.data[offset] = 0;
        offset
    }

    /// The accumulated bytes, without terminator.
    pub fn contents(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            let offset = inner.offset;
            &mut inner.data[..offset]
        })
    }

    /// The accumulated bytes followed by the terminator byte. Only
    /// meaningful after `finish`.
    pub fn terminated(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            let offset = inner.offset;
            &mut inner.data[..=offset]
        })
    }
}

impl Inner {
    fn append(&mut self, segment: &[u8]) -> bool {
        if self.offset + segment.len() < self.data.len() {
            self.data[self.offset..self.offset + segment.len()].copy_from_slice(segment);
            self.offset += segment.len();
            true
        } else {
            self.dropped += segment.len();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_advance_offset() {
        let buf = ResponseBuffer::new();
        assert!(buf.append(b"HTTP/1.1 200 OK\r\n"));
        assert!(buf.append(b"\r\n"));
        assert_eq!(buf.offset(), 19);
        assert_eq!(&*buf.contents(), b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn same_chunk_twice_counts_both() {
        let buf = ResponseBuffer::new();
        let chunk = vec![b'x'; 500];
        assert!(buf.append(&chunk));
        assert!(buf.append(&chunk));
        assert_eq!(buf.offset(), 1000);
    }

    #[test]
    fn segment_reaching_capacity_is_dropped() {
        let buf = ResponseBuffer::with_capacity(8);
        assert!(buf.append(b"1234567"));
        assert!(!buf.append(b"8"));
        assert_eq!(buf.offset(), 7);
        assert_eq!(buf.dropped(), 1);
    }

    #[test]
    fn oversized_segment_skipped_but_later_small_one_fits() {
        let buf = ResponseBuffer::with_capacity(8);
        let chain = RecvChain::from_segments([b"abc".to_vec(), b"defghij".to_vec(), b"kl".to_vec()]);
        assert_eq!(buf.append_chain(&chain), 5);
        assert_eq!(&*buf.contents(), b"abckl");
        assert_eq!(buf.dropped(), 7);
    }

    #[test]
    fn full_capacity_response_loses_last_byte() {
        let buf = ResponseBuffer::new();
        let chain = RecvChain::from_segments([vec![b'a'; RESPONSE_CAPACITY - 1], vec![b'z']]);
        assert_eq!(buf.append_chain(&chain), RESPONSE_CAPACITY - 1);
        buf.mark_complete();

        assert_eq!(buf.finish(), RESPONSE_CAPACITY - 1);
        let terminated = buf.terminated();
        assert_eq!(terminated.len(), RESPONSE_CAPACITY);
        assert_eq!(terminated[RESPONSE_CAPACITY - 1], 0);
        assert!(!terminated.contains(&b'z'));
    }

    #[test]
    fn empty_response_is_empty_terminated_string() {
        let buf = ResponseBuffer::new();
        buf.mark_complete();
        assert_eq!(buf.finish(), 0);
        assert_eq!(&*buf.terminated(), &[0u8]);
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn completion_flag_starts_clear() {
        let buf = ResponseBuffer::default();
        assert!(!buf.is_complete());
        buf.mark_complete();
        assert!(buf.is_complete());
        assert_eq!(buf.capacity(), RESPONSE_CAPACITY);
    }
}
