// ABOUTME: Growable byte arena backing the incremental wire-protocol parser
// ABOUTME: Wraps bytes::BytesMut with the append/consume/clear discipline the parser depends on

use crate::error::SsdbError;
use bytes::{Buf, Bytes, BytesMut};

/// Hard upper bound on how large a single connection's read buffer may
/// grow. Exceeding this while appending fails the append with
/// [`SsdbError::OutOfMemory`] rather than growing further.
pub const MAX_CAPACITY: usize = 16 * 1024 * 1024;

/// The initial capacity a freshly created buffer reserves.
pub const INITIAL_CAPACITY: usize = 8 * 1024;

/// A growable byte arena with append/consume/shift semantics.
///
/// One `ByteBuffer` backs exactly one [`crate::frame::FrameParser`], and by
/// extension exactly one [`crate::connection::Connection`]. Reads from the
/// socket are appended to the tail; a successfully parsed frame is consumed
/// from the head, sliding the remaining bytes down to offset zero so that
/// the parser always scans from position zero.
#[derive(Debug)]
pub struct ByteBuffer {
    data: BytesMut,
}

impl ByteBuffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes are currently held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the held bytes for scanning.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` to the tail of the buffer.
    ///
    /// Fails with [`SsdbError::OutOfMemory`] if doing so would require the
    /// buffer to hold more than [`MAX_CAPACITY`] bytes. `BytesMut` grows
    /// geometrically on its own, so no explicit doubling logic is needed
    /// here beyond the hard ceiling check.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), SsdbError> {
        if self.data.len().saturating_add(bytes.len()) > MAX_CAPACITY {
            return Err(SsdbError::OutOfMemory);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Remove the first `n` bytes, shifting the remainder to offset zero.
    /// If `n >= len()`, the buffer becomes empty.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Release the backing storage. The next `append` reallocates.
    pub fn clear(&mut self) {
        self.data = BytesMut::new();
    }

    /// Split the first `n` bytes off as a reference-counted, zero-copy
    /// [`Bytes`] handle, leaving the remainder in place. Used by
    /// [`crate::frame::FrameParser`] to hand out blobs that borrow from the
    /// buffer's allocation instead of copying each one out.
    pub(crate) fn split_to(&mut self, n: usize) -> Bytes {
        self.data.split_to(n).freeze()
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
