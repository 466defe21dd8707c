//! The packet-aware receive buffer.
//!
//! Incoming bytes are accumulated here until a declared message length is
//! satisfied. The consumer (the peer session) frames the stream: it declares
//! the size of the next expected packet, feeds socket reads into the buffer
//! and is told when the packet is complete. Bytes past the current packet
//! boundary are never consumed, so the remainder of a socket read carries
//! into the next frame naturally.

use crate::error::{Error, Result};

/// The receive buffer of a single peer connection.
pub(crate) struct RecvBuffer {
    storage: Vec<u8>,
    /// The write cursor: the number of valid bytes in `storage`.
    recv_pos: usize,
    /// The offset at which the current packet starts. Always at most
    /// `recv_pos`, which in turn never exceeds the end of the current packet.
    packet_start: usize,
    /// The declared size of the packet in flight, or `None` when no packet
    /// is framed yet.
    packet_size: Option<usize>,
    /// The cap on how large a packet we are willing to buffer.
    max_size: usize,
}

impl RecvBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            storage: Vec::new(),
            recv_pos: 0,
            packet_start: 0,
            packet_size: None,
            max_size,
        }
    }

    /// Declares the size of the next expected packet. Any bytes of the
    /// previous packet must have been taken out with
    /// [`RecvBuffer::advance_packet`] first.
    ///
    /// A size beyond the buffer's cap is a protocol violation on the remote's
    /// part and fails the connection.
    pub fn reset(&mut self, size: usize) -> Result<()> {
        debug_assert!(size >= 1, "zero sized packets are not framed");
        if size > self.max_size {
            return Err(Error::ProtocolViolation("message too large"));
        }
        self.packet_size = Some(size);
        if self.storage.len() < self.packet_start + size {
            self.storage.resize(self.packet_start + size, 0);
        }
        Ok(())
    }

    /// Whether a packet has been framed with [`RecvBuffer::reset`] and not
    /// yet consumed.
    pub fn has_packet(&self) -> bool {
        self.packet_size.is_some()
    }

    /// Copies bytes of `src` into the current packet, up to the packet
    /// boundary. Returns the number of bytes consumed and whether the packet
    /// is now complete. The unconsumed remainder of `src`, if any, belongs to
    /// the next frame and should be offered again after the next `reset`.
    pub fn write(&mut self, src: &[u8]) -> (usize, bool) {
        let size = match self.packet_size {
            Some(size) => size,
            None => {
                debug_assert!(false, "write without a framed packet");
                return (0, false);
            }
        };
        let packet_end = self.packet_start + size;
        debug_assert!(self.recv_pos <= packet_end);
        let needed = packet_end - self.recv_pos;
        let n = needed.min(src.len());
        self.storage[self.recv_pos..self.recv_pos + n]
            .copy_from_slice(&src[..n]);
        self.recv_pos += n;
        (n, self.recv_pos == packet_end)
    }

    /// The bytes of the completed packet.
    pub fn packet(&self) -> &[u8] {
        let size = self.packet_size.unwrap_or(0);
        debug_assert_eq!(self.recv_pos, self.packet_start + size);
        &self.storage[self.packet_start..self.packet_start + size]
    }

    /// Discards the current packet and re-slots the buffer: any tail bytes
    /// are shifted to position 0 to begin the next packet.
    pub fn advance_packet(&mut self) {
        let size = self.packet_size.take().unwrap_or(0);
        let consumed_end = self.packet_start + size;
        debug_assert!(self.recv_pos <= consumed_end);
        let tail = consumed_end.min(self.recv_pos)..self.recv_pos;
        if !tail.is_empty() {
            self.storage.copy_within(tail.clone(), 0);
        }
        self.recv_pos = tail.len();
        self.packet_start = 0;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_single_write_completes_packet() {
        let mut buf = RecvBuffer::new(64);
        buf.reset(4).unwrap();
        let (n, complete) = buf.write(&[0, 0, 0, 5]);
        assert_eq!((n, complete), (4, true));
        assert_eq!(buf.packet(), &[0, 0, 0, 5]);
    }

    #[test]
    fn test_byte_by_byte_arrival_is_equivalent() {
        let mut buf = RecvBuffer::new(64);
        buf.reset(4).unwrap();
        for (i, b) in [0u8, 0, 0, 5].iter().enumerate() {
            let (n, complete) = buf.write(&[*b]);
            assert_eq!(n, 1);
            assert_eq!(complete, i == 3);
        }
        assert_eq!(buf.packet(), &[0, 0, 0, 5]);
    }

    #[test]
    fn test_residual_bytes_carry_into_next_frame() {
        let mut buf = RecvBuffer::new(64);
        // a 2 byte packet and the first byte of the next frame arrive in one
        // socket read
        buf.reset(2).unwrap();
        let read = [0xab, 0xcd, 0xef];
        let (n, complete) = buf.write(&read);
        assert_eq!((n, complete), (2, true));
        assert_eq!(buf.packet(), &[0xab, 0xcd]);

        buf.advance_packet();
        buf.reset(1).unwrap();
        let (n, complete) = buf.write(&read[n..]);
        assert_eq!((n, complete), (1, true));
        assert_eq!(buf.packet(), &[0xef]);
    }

    #[test]
    fn test_reslot_reuses_storage() {
        let mut buf = RecvBuffer::new(64);
        for round in 0..3u8 {
            buf.reset(3).unwrap();
            let (_, complete) = buf.write(&[round; 3]);
            assert!(complete);
            assert_eq!(buf.packet(), &[round; 3]);
            buf.advance_packet();
            assert_eq!(buf.recv_pos, 0);
            assert_eq!(buf.packet_start, 0);
        }
    }

    #[test]
    fn test_oversize_packet_is_protocol_violation() {
        let mut buf = RecvBuffer::new(16);
        assert!(matches!(
            buf.reset(17),
            Err(Error::ProtocolViolation(_))
        ));
        // the cap itself is fine
        assert!(buf.reset(16).is_ok());
    }
}
