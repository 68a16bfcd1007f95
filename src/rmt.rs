//! Relaying and multiplexing task.
//!
//! [`rmt_tx`] takes a destination address and a PDU, resolves the lower
//! flow through the forwarding table and pushes the PDU down. A PDU for
//! this IPCP's own address loops back into the local receive pipeline.
//!
//! When the lower flow signals backpressure, a non-blocking transmit parks
//! the PDU in the lower IPCP's bounded deferred-transmission queue; a
//! blocking transmit suspends on the lower IPCP's transmit wait and
//! retries. The lower layer reports freed transmit room through
//! [`LowerIpcp::on_tx_complete`], which drains the deferred queue and wakes
//! blocked senders.

use crate::buffer::PduBuf;
use crate::error::EfcpError;
use crate::ipcp::Ipcp;
use crate::pci::Address;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Bound on each lower IPCP's deferred-transmission queue.
pub(crate) const RMTQ_MAX_LEN: usize = 64;

/// Write side of an N-1 flow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LowerFlowIo: Send + Sync + 'static {
    /// Pushes one PDU to the N-1 flow. `Err(WouldBlock)` signals
    /// backpressure; the PDU stays with the caller.
    async fn sdu_write(&self, pdu: &PduBuf, may_block: bool) -> Result<(), EfcpError>;
}

/// A lower IPC process, shared by all lower flows it provides.
pub struct LowerIpcp {
    name: String,
    rmtq: Mutex<VecDeque<PduBuf>>,
    tx_wait: Notify,
}

impl LowerIpcp {
    pub fn new(name: impl Into<String>) -> Arc<LowerIpcp> {
        Arc::new(LowerIpcp {
            name: name.into(),
            rmtq: Mutex::new(VecDeque::new()),
            tx_wait: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called by the lower layer when transmit room frees up: re-attempts
    /// the deferred writes in order, stopping at the first renewed
    /// backpressure, then wakes blocked senders.
    pub async fn on_tx_complete(self: &Arc<Self>) {
        loop {
            let pdu = self.rmtq.lock().unwrap().pop_front();
            let Some(pdu) = pdu else {
                break;
            };
            let Some(flow) = pdu.tx_compl_flow().and_then(Weak::upgrade) else {
                debug!("deferred PDU outlived its lower flow - dropping");
                continue;
            };
            match flow.io.sdu_write(&pdu, false).await {
                Ok(()) => {}
                Err(EfcpError::WouldBlock) => {
                    self.rmtq.lock().unwrap().push_front(pdu);
                    break;
                }
                Err(e) => {
                    warn!("lower flow write failed while draining rmtq: {e}");
                }
            }
        }
        self.tx_wait.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn rmtq_len(&self) -> usize {
        self.rmtq.lock().unwrap().len()
    }
}

/// An N-1 flow: the write endpoint plus the lower IPCP it runs on.
pub struct LowerFlow {
    port_id: u32,
    pub(crate) ipcp: Arc<LowerIpcp>,
    pub(crate) io: Arc<dyn LowerFlowIo>,
}

impl LowerFlow {
    pub fn new(port_id: u32, ipcp: Arc<LowerIpcp>, io: Arc<dyn LowerFlowIo>) -> Arc<LowerFlow> {
        Arc::new(LowerFlow { port_id, ipcp, io })
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    pub fn lower_ipcp(&self) -> &Arc<LowerIpcp> {
        &self.ipcp
    }
}

/// Transmits `pdu` towards `remote_addr`, consuming it on every outcome
/// except `WouldBlock` relief through the deferred queue (which also
/// consumes it).
pub(crate) async fn rmt_tx(
    ipcp: &Arc<Ipcp>,
    remote_addr: Address,
    pdu: PduBuf,
    may_block: bool,
) -> Result<(), EfcpError> {
    let Some(lower) = ipcp.pduft().lookup(remote_addr) else {
        if remote_addr != ipcp.address() {
            debug!("no route to IPCP {remote_addr}, dropping packet");
            return Err(EfcpError::HostUnreachable(remote_addr));
        }
        // A self flow: the PDU loops back into this IPCP. Boxing breaks the
        // cycle between this future and the receive pipeline's.
        let loopback: Pin<Box<dyn Future<Output = Result<(), EfcpError>> + Send + '_>> =
            Box::pin(ipcp.sdu_rx(pdu));
        return loopback.await;
    };

    let mut pdu = pdu;
    loop {
        let tx_ready = lower.ipcp.tx_wait.notified();
        match lower.io.sdu_write(&pdu, may_block).await {
            Err(EfcpError::WouldBlock) => {
                if may_block {
                    tx_ready.await;
                    continue;
                }
                let mut rmtq = lower.ipcp.rmtq.lock().unwrap();
                if rmtq.len() < RMTQ_MAX_LEN {
                    pdu.set_tx_compl_flow(Arc::downgrade(&lower));
                    rmtq.push_back(pdu);
                } else {
                    debug!("rmtq overrun: dropping PDU");
                }
                return Ok(());
            }
            other => return other,
        }
    }
}
