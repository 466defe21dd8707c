//! The chained send buffer.
//!
//! A peer's outgoing bytes are queued here before the socket write. The
//! buffer is a FIFO chain of heterogeneously owned byte regions: a region may
//! be a plain heap allocation holding protocol chatter, a reference into the
//! disk cache pinning a block, or any other owned storage. This is what makes
//! sending disk-originated payload zero-copy: the disk block is handed over
//! by ownership and released (unpinning the cache entry) only once all its
//! bytes have left the socket.

use std::{collections::VecDeque, io::IoSlice};

use bytes::Bytes;

/// An owned byte region that can be queued in the [`SendBuffer`].
///
/// Dropping the value releases the backing storage, whatever that means for
/// the concrete type (freeing a heap block, unpinning a disk cache entry).
/// Mutable access is optional: regions that wrap shared or read-only storage
/// return `None` from [`OwnedBuf::as_mut_slice`] and can consequently never
/// host an appendix.
pub trait OwnedBuf: Send {
    /// The full backing region. Its length is the entry's capacity.
    fn as_slice(&self) -> &[u8];

    /// Mutable access to the backing region, if the storage permits writes.
    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        None
    }
}

impl OwnedBuf for Vec<u8> {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Some(self)
    }
}

impl OwnedBuf for Box<[u8]> {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Some(self)
    }
}

impl OwnedBuf for Bytes {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

/// A single entry in the chain.
///
/// `start + capacity` always equals the length of the backing region: popping
/// bytes off a partially consumed head advances `start` and shrinks both
/// `used` and `capacity`, so that the buffer's total capacity reflects the
/// bytes actually remaining in the chain.
struct Buffer {
    holder: Box<dyn OwnedBuf>,
    /// Offset of the first unsent byte in the backing region.
    start: usize,
    /// The number of bytes to send, starting at `start`.
    used: usize,
    /// The remaining capacity of the region, starting at `start`.
    capacity: usize,
}

impl Buffer {
    fn readable(&self) -> &[u8] {
        &self.holder.as_slice()[self.start..self.start + self.used]
    }
}

/// The chained send buffer. See the module documentation.
pub struct SendBuffer {
    chain: VecDeque<Buffer>,
    /// The number of bytes queued for sending. Always the sum of the entries'
    /// used sizes.
    bytes: usize,
    /// The total remaining capacity of all entries, including unused suffix
    /// space.
    capacity: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            chain: VecDeque::new(),
            bytes: 0,
            capacity: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// The number of queued (sendable) bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// The total capacity of the chain, including free suffix space.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes a new entry at the back of the chain, taking ownership of the
    /// region. The first `used` bytes of the region are queued for sending.
    pub fn append_owned(&mut self, buf: impl OwnedBuf + 'static, used: usize) {
        debug_assert!(buf.as_slice().len() >= used);
        self.push_entry(buf, used, false);
    }

    /// Like [`SendBuffer::append_owned`] but the entry goes to the front of
    /// the chain. Used for small protocol headers that must precede an
    /// already queued payload.
    pub fn prepend_owned(&mut self, buf: impl OwnedBuf + 'static, used: usize) {
        debug_assert!(buf.as_slice().len() >= used);
        self.push_entry(buf, used, true);
    }

    fn push_entry(
        &mut self,
        buf: impl OwnedBuf + 'static,
        used: usize,
        front: bool,
    ) {
        let capacity = buf.as_slice().len();
        let entry = Buffer {
            holder: Box::new(buf),
            start: 0,
            used,
            capacity,
        };
        self.bytes += used;
        self.capacity += capacity;
        debug_assert!(self.bytes <= self.capacity);
        if front {
            self.chain.push_front(entry);
        } else {
            self.chain.push_back(entry);
        }
    }

    /// The number of free bytes at the end of the last entry in the chain.
    pub fn space_in_last_buffer(&self) -> usize {
        match self.chain.back() {
            Some(b) => b.capacity - b.used,
            None => 0,
        }
    }

    /// Tries to copy `src` into the free suffix of the last entry. Returns
    /// `None` without copying anything if there is not enough room (or the
    /// entry's storage is read-only); a new entry is never allocated
    /// implicitly.
    pub fn append_bytes(&mut self, src: &[u8]) -> Option<()> {
        let dst = self.allocate_appendix(src.len())?;
        dst.copy_from_slice(src);
        Some(())
    }

    /// Reserves `n` bytes of contiguous space at the end of the last entry
    /// and returns it for writing. Returns `None` if there is not enough
    /// room or the entry's storage is read-only.
    pub fn allocate_appendix(&mut self, n: usize) -> Option<&mut [u8]> {
        let b = self.chain.back_mut()?;
        if b.capacity - b.used < n {
            return None;
        }
        let offset = b.start + b.used;
        let slice = b.holder.as_mut_slice()?;
        b.used += n;
        self.bytes += n;
        debug_assert!(self.bytes <= self.capacity);
        Some(&mut slice[offset..offset + n])
    }

    /// Advances the consumer cursor by `n` bytes, releasing entries that
    /// become fully consumed (running their owners' destructors). A partially
    /// consumed head entry keeps its tail bytes: its start offset advances
    /// and its used size and capacity shrink accordingly.
    pub fn pop_front(&mut self, n: usize) {
        debug_assert!(n <= self.bytes);
        let mut left = n.min(self.bytes);
        while left > 0 {
            let b = match self.chain.front_mut() {
                Some(b) => b,
                None => break,
            };
            if b.used > left {
                b.start += left;
                b.used -= left;
                b.capacity -= left;
                self.bytes -= left;
                self.capacity -= left;
                debug_assert!(self.bytes <= self.capacity);
                return;
            }
            left -= b.used;
            self.bytes -= b.used;
            self.capacity -= b.capacity;
            // drops the holder, releasing the backing storage
            self.chain.pop_front();
        }
    }

    /// Projects up to `limit` readable bytes as a scatter-gather list,
    /// without copying. The slices borrow from the chain and are valid until
    /// the next mutating call.
    pub fn build_iovec(&self, limit: usize) -> Vec<IoSlice<'_>> {
        let mut vec = Vec::new();
        let mut left = limit;
        for b in self.chain.iter() {
            if left == 0 {
                break;
            }
            // an entry may be freshly appended with no used bytes yet, as
            // a landing pad for append_bytes
            if b.used == 0 {
                continue;
            }
            let readable = b.readable();
            if readable.len() > left {
                vec.push(IoSlice::new(&readable[..left]));
                break;
            }
            vec.push(IoSlice::new(readable));
            left -= readable.len();
        }
        vec
    }

    /// Drops all entries, running their owners' destructors.
    pub fn clear(&mut self) {
        self.chain.clear();
        self.bytes = 0;
        self.capacity = 0;
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    /// A region that counts its drops, to verify the ownership contract.
    struct DropCounter {
        data: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl DropCounter {
        fn new(len: usize, drops: Arc<AtomicUsize>) -> Self {
            Self {
                data: vec![0; len],
                drops,
            }
        }
    }

    impl OwnedBuf for DropCounter {
        fn as_slice(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collect(iovec: &[IoSlice<'_>]) -> Vec<u8> {
        iovec.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_append_and_pop_conservation() {
        let mut buf = SendBuffer::new();
        buf.append_owned(vec![1u8; 10], 10);
        buf.append_owned(vec![2u8; 8], 5);
        assert_eq!(buf.len(), 15);
        assert_eq!(buf.capacity(), 18);

        buf.pop_front(7);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.capacity(), 11);

        buf.pop_front(8);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_front_over_entry_boundary() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut buf = SendBuffer::new();
        buf.append_owned(DropCounter::new(10, Arc::clone(&drops)), 10);
        buf.append_owned(DropCounter::new(5, Arc::clone(&drops)), 5);
        buf.append_owned(DropCounter::new(20, Arc::clone(&drops)), 20);
        assert_eq!(buf.len(), 35);

        buf.pop_front(12);
        // the first region is released, the second is partially consumed
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(buf.len(), 23);
        {
            let head = buf.chain.front().unwrap();
            assert_eq!(head.start, 2);
            assert_eq!(head.used, 3);
            assert_eq!(head.capacity, 3);
        }

        buf.pop_front(23);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_clear_releases_all_entries() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut buf = SendBuffer::new();
        buf.append_owned(DropCounter::new(4, Arc::clone(&drops)), 4);
        buf.append_owned(DropCounter::new(4, Arc::clone(&drops)), 2);
        buf.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_append_bytes_into_tail() {
        let mut buf = SendBuffer::new();
        let mut region = vec![0u8; 8];
        region[..3].copy_from_slice(b"abc");
        buf.append_owned(region, 3);

        assert_eq!(buf.space_in_last_buffer(), 5);
        assert!(buf.append_bytes(b"def").is_some());
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.space_in_last_buffer(), 2);

        // more than the remaining room fails without copying anything
        assert!(buf.append_bytes(b"xyz").is_none());
        assert_eq!(buf.len(), 6);

        let iovec = buf.build_iovec(usize::MAX);
        assert_eq!(collect(&iovec), b"abcdef");
    }

    #[test]
    fn test_append_bytes_into_read_only_tail_fails() {
        let mut buf = SendBuffer::new();
        buf.append_owned(Bytes::from_static(b"abc"), 3);
        assert!(buf.append_bytes(b"d").is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_allocate_appendix() {
        let mut buf = SendBuffer::new();
        buf.append_owned(vec![0u8; 10], 4);
        {
            let appendix = buf.allocate_appendix(4).unwrap();
            appendix.copy_from_slice(b"tail");
        }
        assert_eq!(buf.len(), 8);
        assert!(buf.allocate_appendix(3).is_none());
        assert_eq!(collect(&buf.build_iovec(usize::MAX))[4..], *b"tail");
    }

    #[test]
    fn test_prepend_header_before_payload() {
        let mut buf = SendBuffer::new();
        buf.append_owned(Bytes::from_static(b"payload"), 7);
        buf.prepend_owned(b"hdr:".to_vec(), 4);
        assert_eq!(collect(&buf.build_iovec(usize::MAX)), b"hdr:payload");
    }

    #[test]
    fn test_build_iovec_respects_limit() {
        let mut buf = SendBuffer::new();
        buf.append_owned(b"hello".to_vec(), 5);
        buf.append_owned(b"world".to_vec(), 5);

        let iovec = buf.build_iovec(7);
        assert_eq!(collect(&iovec), b"hellowo");

        // never returns more than the queued bytes
        let iovec = buf.build_iovec(100);
        assert_eq!(collect(&iovec), b"helloworld");

        let iovec = buf.build_iovec(0);
        assert!(iovec.is_empty());
    }

    #[test]
    fn test_fifo_byte_order_across_partial_pops() {
        let mut buf = SendBuffer::new();
        let mut sent = Vec::new();
        buf.append_owned(b"abcdefgh".to_vec(), 8);
        buf.append_owned(b"ijk".to_vec(), 3);
        buf.append_owned(b"lmnop".to_vec(), 5);

        // drain in odd sized chunks, as a socket would
        for chunk in &[3usize, 1, 6, 4, 2] {
            let iovec = buf.build_iovec(*chunk);
            sent.extend(collect(&iovec));
            buf.pop_front(*chunk);
        }
        assert_eq!(sent, b"abcdefghijklmnop");
        assert!(buf.is_empty());
    }
}
