//! PDU buffers with an explicit header area.
//!
//! A [`PduBuf`] owns a contiguous allocation whose front part is reserved
//! for headers. Pushing a header moves the view boundary towards the start
//! of the allocation, popping moves it back towards the payload. Popped
//! header bytes stay resident in front of the view, so a header can still
//! be inspected after the payload has been handed upward.
//!
//! Besides the wire content, a buffer carries metadata used by the engine:
//! the retransmission expiry stamped when the buffer sits in a
//! retransmission queue, and a back-reference to the lower flow recorded
//! when the buffer is parked in a deferred-transmission queue.

use crate::error::EfcpError;
use crate::rmt::LowerFlow;
use std::fmt::{Debug, Formatter};
use std::sync::Weak;
use tokio::time::Instant;

pub struct PduBuf {
    data: Vec<u8>,
    /// Start of the current view; everything before it is header room.
    offset: usize,
    rtx_expiry: Option<Instant>,
    tx_compl_flow: Option<Weak<LowerFlow>>,
}

impl PduBuf {
    /// Allocates a buffer holding `payload`, with `headroom` bytes reserved
    /// in front of it for headers.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> PduBuf {
        let mut data = vec![0u8; headroom];
        data.extend_from_slice(payload);
        PduBuf {
            data,
            offset: headroom,
            rtx_expiry: None,
            tx_compl_flow: None,
        }
    }

    /// Length of the current view (headers pushed so far plus payload).
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining header room in front of the view.
    pub fn headroom(&self) -> usize {
        self.offset
    }

    /// Reserves `len` bytes in front of the current view and returns them
    /// for the caller to fill in.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], EfcpError> {
        if self.offset < len {
            return Err(EfcpError::NoHeaderSpace(len));
        }
        self.offset -= len;
        let offset = self.offset;
        Ok(&mut self.data[offset..offset + len])
    }

    /// Advances the view past a `len`-byte header.
    pub fn pop_header(&mut self, len: usize) -> Result<(), EfcpError> {
        if self.len() < len {
            return Err(EfcpError::Truncated {
                need: len,
                have: self.len(),
            });
        }
        self.offset += len;
        Ok(())
    }

    /// The `len` bytes immediately in front of the view - the header most
    /// recently popped with [`pop_header`](Self::pop_header).
    pub fn recent_header(&self, len: usize) -> Result<&[u8], EfcpError> {
        if self.offset < len {
            return Err(EfcpError::Truncated {
                need: len,
                have: self.offset,
            });
        }
        Ok(&self.data[self.offset - len..self.offset])
    }

    pub(crate) fn rtx_expiry(&self) -> Option<Instant> {
        self.rtx_expiry
    }

    pub(crate) fn set_rtx_expiry(&mut self, expiry: Instant) {
        self.rtx_expiry = Some(expiry);
    }

    pub(crate) fn tx_compl_flow(&self) -> Option<&Weak<LowerFlow>> {
        self.tx_compl_flow.as_ref()
    }

    pub(crate) fn set_tx_compl_flow(&mut self, flow: Weak<LowerFlow>) {
        self.tx_compl_flow = Some(flow);
    }
}

impl AsRef<[u8]> for PduBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

impl Clone for PduBuf {
    fn clone(&self) -> PduBuf {
        PduBuf {
            data: self.data.clone(),
            offset: self.offset,
            rtx_expiry: self.rtx_expiry,
            tx_compl_flow: self.tx_compl_flow.clone(),
        }
    }
}

impl Debug for PduBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PduBuf")
            .field("len", &self.len())
            .field("headroom", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(0, b"")]
    #[case::payload_only(0, b"hello")]
    #[case::headroom_only(16, b"")]
    #[case::both(16, b"hello")]
    fn test_with_headroom(#[case] headroom: usize, #[case] payload: &[u8]) {
        let buf = PduBuf::with_headroom(headroom, payload);
        assert_eq!(buf.len(), payload.len());
        assert_eq!(buf.headroom(), headroom);
        assert_eq!(buf.as_ref(), payload);
    }

    #[test]
    fn test_push_pop_restores_view() {
        let mut buf = PduBuf::with_headroom(8, b"payload");

        let hdr = buf.push_header(8).unwrap();
        hdr.copy_from_slice(b"HDRHDRHD");
        assert_eq!(buf.len(), 8 + 7);
        assert_eq!(&buf.as_ref()[..8], b"HDRHDRHD");

        buf.pop_header(8).unwrap();
        assert_eq!(buf.as_ref(), b"payload");
        assert_eq!(buf.headroom(), 8);
    }

    #[test]
    fn test_push_header_exhausted() {
        let mut buf = PduBuf::with_headroom(4, b"x");
        assert_eq!(
            buf.push_header(8).unwrap_err(),
            EfcpError::NoHeaderSpace(8)
        );
        // a failed push does not move the view
        assert_eq!(buf.as_ref(), b"x");

        buf.push_header(4).unwrap();
        assert_eq!(
            buf.push_header(1).unwrap_err(),
            EfcpError::NoHeaderSpace(1)
        );
    }

    #[test]
    fn test_pop_header_truncated() {
        let mut buf = PduBuf::with_headroom(0, b"abc");
        assert_eq!(
            buf.pop_header(4).unwrap_err(),
            EfcpError::Truncated { need: 4, have: 3 }
        );
        assert_eq!(buf.as_ref(), b"abc");
    }

    #[test]
    fn test_recent_header() {
        let mut buf = PduBuf::with_headroom(4, b"data");
        buf.push_header(4).unwrap().copy_from_slice(b"HDR!");
        buf.pop_header(4).unwrap();

        assert_eq!(buf.as_ref(), b"data");
        assert_eq!(buf.recent_header(4).unwrap(), b"HDR!");
        assert!(buf.recent_header(5).is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut buf = PduBuf::with_headroom(4, b"data");
        let clone = buf.clone();

        buf.push_header(2).unwrap().copy_from_slice(b"ab");
        assert_eq!(clone.as_ref(), b"data");
        assert_eq!(clone.headroom(), 4);
    }
}
