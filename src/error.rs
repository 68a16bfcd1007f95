use crate::buffer::PduBuf;
use crate::pci::Address;
use thiserror::Error;

/// Errors surfaced by the data-transfer engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EfcpError {
    /// No forwarding-table entry for a non-local destination.
    #[error("no route to IPCP {0}")]
    HostUnreachable(Address),

    /// The lower flow cannot accept more data right now.
    #[error("lower flow signalled backpressure")]
    WouldBlock,

    /// The buffer's reserved header area is too small.
    #[error("buffer headroom cannot fit a {0} byte header")]
    NoHeaderSpace(usize),

    /// The buffer is shorter than the header to be read or skipped.
    #[error("buffer truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Error type of the flow write path.
#[derive(Debug, Error)]
pub enum SduWriteError {
    /// The sender window or the retransmission queue is full. The rejected
    /// buffer is handed back; the caller retries the write with it.
    #[error("flow is backpressured")]
    Backpressure(PduBuf),

    #[error(transparent)]
    Efcp(#[from] EfcpError),
}
