//! Upward delivery seam.

use crate::buffer::PduBuf;
use crate::pci::{Address, CepId};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Consumer sitting on top of the IPCP. Implementations receive SDUs after
/// sequencing has run, strictly non-decreasing in sequence number per flow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SduDispatcher: Send + Sync + 'static {
    /// A data SDU for the flow identified by its local CEP-id. The header
    /// has already been stripped. `limit_rx_queue` asks the consumer to
    /// bound its own queue; it is set when the flow carries no flow control
    /// of its own.
    async fn on_sdu(&self, local_cep: CepId, sdu: PduBuf, limit_rx_queue: bool);

    /// A management SDU addressed to this IPCP, handed to the management
    /// plane.
    async fn on_mgmt_sdu(&self, src_addr: Address, sdu: PduBuf);
}
