//! Data-transfer engine of a RINA "normal" IPC process: per-flow DTP and
//! DTCP state machines, the relaying and multiplexing task with its PDU
//! forwarding table, and the packet reception pipeline.
//!
//! ## What it does
//!
//! * *Sequencing*: every data PDU carries a sequence number; out-of-order
//!   arrivals wait in a bounded sequencing queue and are delivered upward
//!   in non-decreasing order, contiguously when the flow is reliable.
//! * *Retransmission*: transmitted PDUs are cloned into a bounded
//!   retransmission queue and re-sent on timer expiry until the peer acks
//!   them.
//! * *Window flow control*: a credit window bounds the sender; PDUs that
//!   outrun it wait in the closed-window queue until the peer moves the
//!   window edge.
//! * *Relaying*: PDUs not addressed to this IPCP are forwarded through the
//!   PDU forwarding table onto an N-1 flow, with a bounded deferred queue
//!   absorbing lower-layer backpressure.
//!
//! The upper consumer and the lower (N-1) flows are external collaborators
//! behind the [`dispatch::SduDispatcher`] and [`rmt::LowerFlowIo`] traits;
//! the management plane drives the [`ipcp::Ipcp`] API (address
//! configuration, flow initialisation, forwarding-table maintenance,
//! management PDUs).
//!
//! ## PDU header
//!
//! All integers little-endian. Field widths are the build-time "flavour"
//! ([`pci::widths`]); all peers of one DIF must agree on it.
//!
//! ```ascii
//! 0:  destination address
//! *:  source address
//! *:  QoS id
//! *:  destination CEP id
//! *:  source CEP id
//! *:  PDU type (u8): DT 0x80, MGMT 0x40, control iff both top bits set
//! *:  flags (u8): bit 0 = DRF ("this PDU starts a new run")
//! *:  PDU length, including this header
//! *:  sequence number
//! ```
//!
//! Control PDUs (type `CTRL | ACK_BIT | {ACK,NACK,SACK,SNACK}` and/or
//! `CTRL | FC_BIT`) append six sequence-number-wide fields:
//!
//! ```ascii
//! *:  last control sequence number received
//! *:  ack/nack sequence number
//! *:  receiver's new right window edge
//! *:  receiver's new left window edge
//! *:  sender's own right window edge
//! *:  sender's own left window edge
//! ```
//!
//! NACK, SACK and SNACK are recognised and dispatch to policy hooks, but
//! only positive acknowledgement is implemented.
//!
//! ## Window discipline
//!
//! `snd_rwe` is exclusive: a data PDU numbered at or above it does not fit
//! the sender window and parks in the closed-window queue. The drain loop
//! after a window update pops while `snd_lwe < snd_rwe`, so the two edges
//! meet exactly when the window is exhausted.
//!
//! ## Concurrency
//!
//! Per-flow state sits behind one async mutex, held only across bounded
//! work: header manipulation, queue surgery, window arithmetic. Timer
//! handlers and the receive path collect everything to transmit or deliver
//! under the lock and do the I/O after releasing it. The forwarding table
//! and the deferred-transmission queues are leaf locks. Only the blocking
//! transmit mode ever suspends, and only on a lower IPCP's transmit wait.

pub mod buffer;
pub mod config;
pub mod dispatch;
mod dtcp;
pub mod dtp;
pub mod error;
pub mod flow;
pub mod ipcp;
pub mod pci;
pub mod pduft;
pub mod rmt;
mod timers;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
