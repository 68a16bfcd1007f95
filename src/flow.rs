//! A flow and its data path.
//!
//! [`Flow`] bundles the connection endpoints, the flow configuration and
//! the DTP block. The lock around the DTP block is only ever held across
//! bounded work - header manipulation, queue surgery, window arithmetic -
//! and never across calls into the lower layer or deliveries upward:
//! everything to transmit or deliver is collected under the lock and acted
//! on after releasing it.

use crate::buffer::PduBuf;
use crate::config::FlowConfig;
use crate::dtcp;
use crate::dtp::{DtpState, FlowStats, QueuedPdu};
use crate::error::SduWriteError;
use crate::ipcp::Ipcp;
use crate::pci::{
    Address, CepId, Pci, SeqNum, PCI_LEN, PDU_FLAG_DRF, PDU_T_ACK, PDU_T_ACK_BIT, PDU_T_CTRL_MASK,
    PDU_T_DT, PDU_T_FC_BIT,
};
use crate::rmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

pub struct Flow {
    pub(crate) ipcp: Weak<Ipcp>,
    pub(crate) local_cep: CepId,
    pub(crate) remote_cep: CepId,
    pub(crate) remote_addr: Address,
    pub(crate) cfg: FlowConfig,
    /// The consumer above is another IPCP: the advertised window then
    /// follows delivery immediately, instead of waiting for per-SDU consume
    /// notifications from an application.
    pub(crate) upper_is_ipcp: bool,
    pub(crate) dtp: Mutex<DtpState>,
    /// Signalled when control processing may have reopened the window.
    pub(crate) write_ready: Notify,
}

impl Flow {
    pub(crate) fn new(
        ipcp: &Arc<Ipcp>,
        local_cep: CepId,
        remote_cep: CepId,
        remote_addr: Address,
        cfg: FlowConfig,
        upper_is_ipcp: bool,
    ) -> Arc<Flow> {
        let dtp = DtpState::new(&cfg, ipcp.max_pdu_life());
        Arc::new(Flow {
            ipcp: Arc::downgrade(ipcp),
            local_cep,
            remote_cep,
            remote_addr,
            cfg,
            upper_is_ipcp,
            dtp: Mutex::new(dtp),
            write_ready: Notify::new(),
        })
    }

    pub fn local_cep(&self) -> CepId {
        self.local_cep
    }

    pub fn remote_cep(&self) -> CepId {
        self.remote_cep
    }

    pub fn remote_addr(&self) -> Address {
        self.remote_addr
    }

    pub(crate) async fn stats(&self) -> FlowStats {
        self.dtp.lock().await.stats
    }

    /// Cancels all timers and drains the queues. Pending timer handlers are
    /// aborted at their next suspension point; they hold a strong flow
    /// reference while running, so state stays valid until they finish.
    pub(crate) async fn teardown(&self) {
        let mut dtp = self.dtp.lock().await;
        dtp.snd_inact_tmr.cancel();
        dtp.rcv_inact_tmr.cancel();
        dtp.rtx_tmr.cancel();
        dtp.rtx_tmr_next = None;
        dtp.cwq.clear();
        dtp.rtxq.clear();
        dtp.seqq.clear();
    }

    // ---- send path -------------------------------------------------------

    pub(crate) async fn send(
        self: &Arc<Self>,
        ipcp: &Arc<Ipcp>,
        mut sdu: PduBuf,
        may_block: bool,
    ) -> Result<(), SduWriteError> {
        let dtcp_present = self.cfg.dtcp_present;
        let window_fc = self.cfg.window().is_some();

        let mut dtp = self.dtp.lock().await;

        if dtcp_present {
            self.arm_snd_inact(&mut dtp);
        }

        if (window_fc
            && dtp.next_seq_num_to_send > dtp.snd_rwe
            && dtp.cwq.len() >= dtp.max_cwq_len)
            || (self.cfg.dtcp.rtx_control && dtp.rtxq.len() >= dtp.max_rtxq_len)
        {
            drop(dtp);
            return Err(SduWriteError::Backpressure(sdu));
        }

        let total_len = sdu.len() + PCI_LEN;
        let seqnum = dtp.next_seq_num_to_send;
        let pci = Pci {
            dst_addr: self.remote_addr,
            src_addr: ipcp.address(),
            qos_id: 0,
            dst_cep: self.remote_cep,
            src_cep: self.local_cep,
            pdu_type: PDU_T_DT,
            pdu_flags: if dtp.set_drf { PDU_FLAG_DRF } else { 0 },
            pdu_len: total_len as u16,
            seqnum,
        };
        match sdu.push_header(PCI_LEN) {
            Ok(hdr) => {
                let mut hdr: &mut [u8] = hdr;
                pci.ser(&mut hdr);
            }
            Err(e) => {
                dtp.stats.tx_err += 1;
                return Err(e.into());
            }
        }
        dtp.next_seq_num_to_send = seqnum.wrapping_add(1);
        dtp.stats.tx_pkt += 1;
        dtp.stats.tx_byte += sdu.len() as u64;
        dtp.set_drf = false;

        if !dtcp_present {
            dtp.snd_lwe = dtp.next_seq_num_to_send;
            dtp.last_seq_num_sent = Some(seqnum);
            drop(dtp);
            return rmt::rmt_tx(ipcp, self.remote_addr, sdu, may_block)
                .await
                .map_err(Into::into);
        }

        if window_fc {
            if seqnum >= dtp.snd_rwe {
                // Outside the sender window: park in the closed-window
                // queue. The backpressure check above guarantees room.
                trace!("push [{seqnum}] into cwq");
                dtp.cwq.push_back(QueuedPdu { seqnum, pdu: sdu });
                return Ok(());
            }
            dtp.snd_lwe = dtp.next_seq_num_to_send;
            dtp.last_seq_num_sent = Some(seqnum);
            trace!("sending [{seqnum}] through the sender window");
        }

        if self.cfg.dtcp.rtx_control {
            self.rtxq_push(&mut dtp, seqnum, &sdu);
        }

        drop(dtp);
        rmt::rmt_tx(ipcp, self.remote_addr, sdu, may_block)
            .await
            .map_err(Into::into)
    }

    /// Clones the PDU into the retransmission queue and starts the
    /// retransmission timer if it is not already running.
    pub(crate) fn rtxq_push(self: &Arc<Self>, dtp: &mut DtpState, seqnum: SeqNum, pdu: &PduBuf) {
        let mut clone = pdu.clone();
        let expiry = Instant::now() + dtp.rtx_tmr_int;
        clone.set_rtx_expiry(expiry);
        dtp.rtxq.push_back(QueuedPdu { seqnum, pdu: clone });
        trace!("cloning [{seqnum}] into rtxq");

        if !dtp.rtx_tmr.is_armed() {
            dtp.rtx_tmr_next = Some(seqnum);
            self.arm_rtx(dtp, expiry);
        }
    }

    // ---- receive path (data PDUs) ----------------------------------------

    pub(crate) async fn sdu_rx_data(self: &Arc<Self>, ipcp: &Arc<Ipcp>, pci: Pci, pdu: PduBuf) {
        let seqnum = pci.seqnum;
        let pdu_bytes = pdu.len() as u64;
        // Ask the consumer to bound its queue only when this flow carries
        // no flow control of its own.
        let limit_rx_queue = !self.cfg.dtcp.flow_control;
        let mut crb = None;

        let mut dtp = self.dtp.lock().await;

        if self.cfg.dtcp_present {
            self.arm_rcv_inact(&mut dtp);
        }

        if pci.pdu_flags & PDU_FLAG_DRF != 0 {
            // The peer declared a new run: reset receiver state. Whatever
            // the sequencing queue still holds belongs to the old run.
            if !dtp.seqq.is_empty() {
                debug!("new run: discarding {} PDUs from seqq", dtp.seqq.len());
                dtp.seqq.clear();
            }
            dtp.rcv_lwe = seqnum.wrapping_add(1);
            dtp.rcv_lwe_priv = seqnum.wrapping_add(1);
            dtp.max_seq_num_rcvd = Some(seqnum);
            crb = dtcp::sv_update(self, ipcp.address(), &mut dtp);
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += pdu_bytes;
            drop(dtp);

            Self::deliver(ipcp, self.local_cep, pdu, limit_rx_queue).await;
            self.send_ctrl(ipcp, crb).await;
            return;
        }

        if seqnum < dtp.rcv_lwe_priv {
            debug!("dropping duplicate PDU [seq={seqnum}]");
            dtp.stats.rx_err += 1;

            if self.cfg.dtcp.flow_control && dtp.rcv_lwe >= dtp.last_snd_data_ack {
                let ack = dtp.rcv_lwe;
                let pdu_type = PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK | PDU_T_FC_BIT;
                crb = Some(dtcp::ctrl_pdu(self, ipcp.address(), &mut dtp, pdu_type, ack));
                dtp.last_snd_data_ack = ack;
            }
            drop(dtp);

            self.send_ctrl(ipcp, crb).await;
            return;
        }

        match dtp.max_seq_num_rcvd {
            Some(max) if dtp.rcv_lwe_priv < seqnum && seqnum <= max => {
                trace!(
                    "possible gap fill, rcv_lwe_priv would jump {} --> {}",
                    dtp.rcv_lwe_priv,
                    seqnum.wrapping_add(1)
                );
            }
            Some(max) if seqnum == max.wrapping_add(1) => {
                // in-order PDU
            }
            None => {
                // first PDU on this flow
            }
            _ => {
                debug!(
                    "out of order packet, rcv_lwe_priv would jump {} --> {}",
                    dtp.rcv_lwe_priv,
                    seqnum.wrapping_add(1)
                );
            }
        }

        if dtp.max_seq_num_rcvd.map_or(true, |max| seqnum > max) {
            dtp.max_seq_num_rcvd = Some(seqnum);
        }

        let gap = seqnum.wrapping_sub(dtp.rcv_lwe_priv);

        // A PDU beyond the gap tolerance is dropped only when nothing can
        // still fill the gap: no retransmission control, no A timeout, and
        // the flow actually cares about ordering (in-order delivery or DTCP
        // present). Otherwise it waits in the sequencing queue.
        let drop_it = (self.cfg.in_order_delivery || self.cfg.dtcp_present)
            && self.cfg.dtcp.initial_a.is_zero()
            && !self.cfg.dtcp.rtx_control
            && gap > self.cfg.max_sdu_gap;
        let deliver = !drop_it && gap <= self.cfg.max_sdu_gap;

        if deliver {
            dtp.rcv_lwe_priv = seqnum.wrapping_add(1);
            let popped = dtp.seqq_pop_many(self.cfg.max_sdu_gap);

            if self.upper_is_ipcp {
                dtp.rcv_lwe = dtp.rcv_lwe_priv;
                crb = dtcp::sv_update(self, ipcp.address(), &mut dtp);
            }
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += pdu_bytes;
            drop(dtp);

            Self::deliver(ipcp, self.local_cep, pdu, limit_rx_queue).await;
            for qpdu in popped {
                Self::deliver(ipcp, self.local_cep, qpdu.pdu, limit_rx_queue).await;
            }
            self.send_ctrl(ipcp, crb).await;
            return;
        }

        if drop_it {
            debug!("dropping PDU [{seqnum}] to meet QoS requirements");
            dtp.stats.rx_err += 1;
        } else {
            // Neither dropped nor deliverable yet: wait for predecessors.
            dtp.seqq_push(QueuedPdu { seqnum, pdu });
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += pdu_bytes;
        }

        crb = dtcp::sv_update(self, ipcp.address(), &mut dtp);
        drop(dtp);
        self.send_ctrl(ipcp, crb).await;
    }

    async fn deliver(ipcp: &Arc<Ipcp>, local_cep: CepId, mut pdu: PduBuf, limit_rx_queue: bool) {
        if pdu.pop_header(PCI_LEN).is_err() {
            debug!("PDU shorter than its header - dropping");
            return;
        }
        ipcp.dispatcher().on_sdu(local_cep, pdu, limit_rx_queue).await;
    }

    pub(crate) async fn send_ctrl(self: &Arc<Self>, ipcp: &Arc<Ipcp>, crb: Option<PduBuf>) {
        if let Some(crb) = crb {
            rmt::rmt_tx(ipcp, self.remote_addr, crb, false).await.ok();
        }
    }

    // ---- timers ----------------------------------------------------------

    pub(crate) fn arm_snd_inact(self: &Arc<Self>, dtp: &mut DtpState) {
        let deadline = Instant::now() + 3 * dtp.mpl_r_a;
        let weak = Arc::downgrade(self);
        dtp.snd_inact_tmr.rearm(deadline, async move {
            if let Some(flow) = weak.upgrade() {
                flow.on_snd_inact().await;
            }
        });
    }

    pub(crate) fn arm_rcv_inact(self: &Arc<Self>, dtp: &mut DtpState) {
        let deadline = Instant::now() + 2 * dtp.mpl_r_a;
        let weak = Arc::downgrade(self);
        dtp.rcv_inact_tmr.rearm(deadline, async move {
            if let Some(flow) = weak.upgrade() {
                flow.on_rcv_inact().await;
            }
        });
    }

    pub(crate) fn arm_rtx(self: &Arc<Self>, dtp: &mut DtpState, deadline: Instant) {
        let weak = Arc::downgrade(self);
        dtp.rtx_tmr.rearm(deadline, async move {
            if let Some(flow) = weak.upgrade() {
                flow.on_rtx_timer().await;
            }
        });
    }

    /// No data left this flow for 3 * (MPL + R + A): the next data PDU
    /// starts a new run.
    async fn on_snd_inact(self: Arc<Self>) {
        let mut dtp = self.dtp.lock().await;
        dtp.snd_inact_tmr.mark_fired();
        dtp.set_drf = true;
        // TODO purge rtxq and cwq, emit a control ack and notify the upper
        // layer of the inactivity
        debug!("sender inactivity on cep {}", self.local_cep);
    }

    async fn on_rcv_inact(self: Arc<Self>) {
        let mut dtp = self.dtp.lock().await;
        dtp.rcv_inact_tmr.mark_fired();
        debug!("receiver inactivity on cep {}", self.local_cep);
    }

    /// Retransmission timer handler: clone every entry whose expiry has
    /// passed into a batch, advance its expiry by the retransmission
    /// interval, re-arm on the earliest entry not yet due, then transmit
    /// the batch with the lock released.
    ///
    /// An acknowledgement racing with this handler can at worst cause one
    /// redundant retransmission; the peer discards it as a duplicate.
    async fn on_rtx_timer(self: Arc<Self>) {
        let mut batch: Vec<PduBuf> = Vec::new();
        {
            let mut dtp = self.dtp.lock().await;
            dtp.rtx_tmr.mark_fired();

            if let Some(next) = dtp.rtx_tmr_next {
                let now = Instant::now();
                let interval = dtp.rtx_tmr_int;
                let len = dtp.rtxq.len();
                // Scan in expiry order: from the arming entry to the tail,
                // then wrapping to the head (earlier entries have already
                // been retransmitted and carry advanced expiries).
                let start = dtp.rtxq.iter().position(|e| e.seqnum == next).unwrap_or(0);
                let mut rearm = None;
                for offset in 0..len {
                    let idx = (start + offset) % len;
                    let entry = &mut dtp.rtxq[idx];
                    let Some(expiry) = entry.pdu.rtx_expiry() else {
                        continue;
                    };
                    if now >= expiry {
                        entry.pdu.set_rtx_expiry(expiry + interval);
                        trace!("retransmitting [{}] from rtxq", entry.seqnum);
                        batch.push(entry.pdu.clone());
                    } else {
                        rearm = Some((entry.seqnum, expiry));
                        break;
                    }
                }
                // When every entry was due, the scan start now carries the
                // earliest advanced expiry and re-arms the timer.
                let rearm = rearm.or_else(|| {
                    dtp.rtxq.get(start).and_then(|entry| {
                        entry.pdu.rtx_expiry().map(|expiry| (entry.seqnum, expiry))
                    })
                });
                if let Some((seqnum, deadline)) = rearm {
                    dtp.rtx_tmr_next = Some(seqnum);
                    self.arm_rtx(&mut dtp, deadline);
                }
            }
        }

        if batch.is_empty() {
            return;
        }
        let Some(ipcp) = self.ipcp.upgrade() else {
            return;
        };
        for pdu in batch {
            rmt::rmt_tx(&ipcp, self.remote_addr, pdu, false).await.ok();
        }
    }
}
