//! The IPC process: API surface and receive pipeline.
//!
//! An [`Ipcp`] owns its address, the forwarding table, the table of flows
//! keyed by local CEP-id and the registry of lower flows keyed by local
//! port. Incoming PDUs are classified here: not-for-us PDUs are relayed,
//! management PDUs go to the management plane, control PDUs to DTCP and
//! data PDUs into the flow's data path.

use crate::buffer::PduBuf;
use crate::config::{FlowConfig, IpcpConfig};
use crate::dispatch::SduDispatcher;
use crate::dtcp;
use crate::dtp::FlowStats;
use crate::error::{EfcpError, SduWriteError};
use crate::flow::Flow;
use crate::pci::{Address, CepId, Pci, PCI_LEN, PDU_T_DT, PDU_T_MGMT};
use crate::pduft::Pduft;
use crate::rmt::{self, LowerFlow};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, trace_span, Instrument};
use uuid::Uuid;

/// How a management PDU picks its N-1 flow.
pub enum MgmtRoute {
    /// Through the forwarding table, towards a destination address.
    DstAddr(Address),
    /// Directly onto the lower flow bound to a local port.
    LocalPort(u32),
}

pub struct Ipcp {
    address: AtomicU64,
    config: IpcpConfig,
    pduft: Pduft,
    flows: RwLock<FxHashMap<CepId, Arc<Flow>>>,
    lower_flows: RwLock<FxHashMap<u32, Arc<LowerFlow>>>,
    dispatcher: Arc<dyn SduDispatcher>,
}

impl Ipcp {
    pub fn new(config: IpcpConfig, dispatcher: Arc<dyn SduDispatcher>) -> Arc<Ipcp> {
        info!("new IPC process created");
        Arc::new(Ipcp {
            address: AtomicU64::new(0),
            config,
            pduft: Pduft::new(),
            flows: RwLock::new(FxHashMap::default()),
            lower_flows: RwLock::new(FxHashMap::default()),
            dispatcher,
        })
    }

    pub fn address(&self) -> Address {
        self.address.load(Ordering::Relaxed)
    }

    pub(crate) fn max_pdu_life(&self) -> Duration {
        self.config.max_pdu_life
    }

    pub(crate) fn pduft(&self) -> &Pduft {
        &self.pduft
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn SduDispatcher> {
        &self.dispatcher
    }

    /// Sets a named configuration parameter.
    pub fn config(&self, name: &str, value: &str) -> anyhow::Result<()> {
        match name {
            "address" => {
                let address: Address = value.parse()?;
                info!("IPCP address set to {address}");
                self.address.store(address, Ordering::Relaxed);
                Ok(())
            }
            _ => bail!("unknown configuration parameter {name:?}"),
        }
    }

    // ---- forwarding table ------------------------------------------------

    pub fn pduft_set(&self, addr: Address, lower: &Arc<LowerFlow>) {
        self.pduft.set(addr, lower);
    }

    pub fn pduft_del(&self, addr: Address) -> bool {
        self.pduft.del(addr)
    }

    pub fn pduft_flush(&self) {
        self.pduft.flush();
    }

    // ---- lower flows -----------------------------------------------------

    pub fn register_lower_flow(&self, lower: Arc<LowerFlow>) {
        self.lower_flows
            .write()
            .unwrap()
            .insert(lower.port_id(), lower);
    }

    /// Unbinds a lower flow; every forwarding entry it owned goes with it.
    pub fn unregister_lower_flow(&self, port_id: u32) {
        self.lower_flows.write().unwrap().remove(&port_id);
        self.pduft.remove_flow(port_id);
    }

    // ---- flows -----------------------------------------------------------

    /// Creates the DTP block for a flow whose endpoints and configuration
    /// the management plane has established.
    pub async fn flow_init(
        self: &Arc<Self>,
        local_cep: CepId,
        remote_cep: CepId,
        remote_addr: Address,
        cfg: FlowConfig,
        upper_is_ipcp: bool,
    ) -> anyhow::Result<Arc<Flow>> {
        cfg.validate()?;
        let cfg = cfg.sanitized();
        let flow = Flow::new(self, local_cep, remote_cep, remote_addr, cfg, upper_is_ipcp);
        self.flows.write().unwrap().insert(local_cep, flow.clone());
        Ok(flow)
    }

    /// Tears the flow down: timers cancelled, queues drained, demux entry
    /// removed.
    pub async fn flow_destroy(&self, local_cep: CepId) {
        let flow = self.flows.write().unwrap().remove(&local_cep);
        if let Some(flow) = flow {
            flow.teardown().await;
        }
    }

    pub async fn flow_get_stats(&self, flow: &Arc<Flow>) -> FlowStats {
        flow.stats().await
    }

    // ---- data path -------------------------------------------------------

    /// Writes one SDU on a flow. With `may_block` the call waits out
    /// backpressure on the flow's write-ready signal; without it,
    /// backpressure surfaces as [`SduWriteError::Backpressure`] carrying
    /// the SDU back to the caller.
    pub async fn sdu_write(
        self: &Arc<Self>,
        flow: &Arc<Flow>,
        sdu: PduBuf,
        may_block: bool,
    ) -> Result<(), SduWriteError> {
        let mut sdu = sdu;
        loop {
            let write_ready = flow.write_ready.notified();
            match flow.send(self, sdu, may_block).await {
                Err(SduWriteError::Backpressure(rejected)) if may_block => {
                    sdu = rejected;
                    write_ready.await;
                }
                other => return other,
            }
        }
    }

    /// Prepares a management PDU and picks the N-1 flow it should travel
    /// on. The caller keeps ownership of the buffer and performs the write.
    pub fn mgmt_sdu_write(
        &self,
        route: MgmtRoute,
        pdu: &mut PduBuf,
    ) -> Result<Arc<LowerFlow>, EfcpError> {
        let (lower, dst_addr) = match route {
            MgmtRoute::DstAddr(addr) => {
                let Some(lower) = self.pduft.lookup(addr) else {
                    debug!("no route to IPCP {addr}, dropping management PDU");
                    return Err(EfcpError::HostUnreachable(addr));
                };
                (lower, addr)
            }
            MgmtRoute::LocalPort(port_id) => {
                let Some(lower) = self.lower_flows.read().unwrap().get(&port_id).cloned() else {
                    debug!("invalid management header local port {port_id}, dropping PDU");
                    return Err(EfcpError::InvalidArgument(
                        "no lower flow bound to local port",
                    ));
                };
                (lower, 0)
            }
        };

        let total_len = pdu.len() + PCI_LEN;
        let pci = Pci {
            dst_addr,
            src_addr: self.address(),
            qos_id: 0,
            dst_cep: 0,
            src_cep: 0,
            pdu_type: PDU_T_MGMT,
            pdu_flags: 0,
            pdu_len: total_len as u16,
            seqnum: 0,
        };
        let mut hdr: &mut [u8] = pdu.push_header(PCI_LEN)?;
        pci.ser(&mut hdr);
        Ok(lower)
    }

    /// Entry point for PDUs arriving from lower layers (and for loopback).
    ///
    /// Returns a boxed future (rather than being an `async fn`) so that its
    /// opaque type doesn't recursively depend on itself through the
    /// self-addressed loopback path in [`rmt::rmt_tx`], which would make
    /// the `Send` auto-trait unprovable.
    pub fn sdu_rx(
        self: &Arc<Self>,
        pdu: PduBuf,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EfcpError>> + Send + '_>>
    {
        let correlation_id = Uuid::new_v4();
        let span = trace_span!("pdu_received", %correlation_id);
        Box::pin(self.sdu_rx_inner(pdu).instrument(span))
    }

    async fn sdu_rx_inner(self: &Arc<Self>, mut pdu: PduBuf) -> Result<(), EfcpError> {
        let pci = match Pci::parse(pdu.as_ref()) {
            Ok(pci) => pci,
            Err(e) => {
                debug!("dropping PDU with unparsable header: {e}");
                return Ok(());
            }
        };

        if pci.dst_addr != self.address() {
            // Not for this IPCP: relay. The lower layer cannot act on a
            // relaying failure, so the error stops here.
            rmt::rmt_tx(self, pci.dst_addr, pdu, false).await.ok();
            return Ok(());
        }

        if pci.pdu_type == PDU_T_MGMT {
            if pdu.pop_header(PCI_LEN).is_ok() {
                self.dispatcher.on_mgmt_sdu(pci.src_addr, pdu).await;
            }
            return Ok(());
        }

        let flow = self.flows.read().unwrap().get(&pci.dst_cep).cloned();
        let Some(flow) = flow else {
            debug!("no flow for cep-id {}: dropping PDU", pci.dst_cep);
            return Ok(());
        };

        if pci.pdu_type != PDU_T_DT {
            flow.sdu_rx_ctrl(self, pdu).await;
        } else {
            flow.sdu_rx_data(self, pci, pdu).await;
        }
        Ok(())
    }

    /// Called by the upper layer once it has consumed a delivered SDU:
    /// advances the advertised window edge and acknowledges if the flow's
    /// DTCP calls for it.
    pub async fn sdu_rx_consumed(
        self: &Arc<Self>,
        flow: &Arc<Flow>,
        sdu: &PduBuf,
    ) -> Result<(), EfcpError> {
        if !(flow.cfg.dtcp.rtx_control || flow.cfg.dtcp.flow_control) {
            return Ok(());
        }
        let pci = Pci::parse(sdu.recent_header(PCI_LEN)?)?;
        let crb = {
            let mut dtp = flow.dtp.lock().await;
            dtp.rcv_lwe = pci.seqnum.wrapping_add(1);
            dtcp::sv_update(flow, self.address(), &mut dtp)
        };
        flow.send_ctrl(self, crb).await;
        Ok(())
    }

    /// Tears down every flow and empties the forwarding table.
    pub async fn shutdown(&self) {
        let flows: Vec<Arc<Flow>> = self.flows.write().unwrap().drain().map(|(_, f)| f).collect();
        for flow in &flows {
            flow.teardown().await;
        }
        self.pduft.flush();
        info!("IPC process destroyed");
    }
}
