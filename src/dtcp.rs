//! DTCP: control-PDU construction and reception.
//!
//! A control PDU carries the receiver's window edges and, depending on the
//! type bits, an acknowledgement. [`sv_update`] builds at most one control
//! PDU after the advertised left window edge may have advanced; the flow's
//! [`sdu_rx_ctrl`](crate::flow::Flow::sdu_rx_ctrl) applies an incoming one.
//!
//! Each acknowledgement subtype dispatches to a named policy, so selective
//! and negative acknowledgement can be added without touching the data
//! path.

use crate::buffer::PduBuf;
use crate::config::FcType;
use crate::dtp::DtpState;
use crate::flow::Flow;
use crate::ipcp::Ipcp;
use crate::pci::{
    is_ctrl, Address, Pci, PciCtrl, SeqNum, PCI_CTRL_LEN, PDU_T_ACK, PDU_T_ACK_BIT, PDU_T_ACK_MASK,
    PDU_T_CTRL_MASK, PDU_T_FC_BIT, PDU_T_NACK, PDU_T_SACK, PDU_T_SNACK,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Builds a control PDU carrying the flow's current window edges.
/// Runs under the flow lock; consumes one control sequence number.
pub(crate) fn ctrl_pdu(
    flow: &Flow,
    own_addr: Address,
    dtp: &mut DtpState,
    pdu_type: u8,
    ack_nack_seq_num: SeqNum,
) -> PduBuf {
    let seqnum = dtp.next_snd_ctl_seq;
    dtp.next_snd_ctl_seq = seqnum.wrapping_add(1);

    let pcic = PciCtrl {
        base: Pci {
            dst_addr: flow.remote_addr,
            src_addr: own_addr,
            qos_id: 0,
            dst_cep: flow.remote_cep,
            src_cep: flow.local_cep,
            pdu_type,
            pdu_flags: 0,
            pdu_len: PCI_CTRL_LEN as u16,
            seqnum,
        },
        last_ctrl_seq_num_rcvd: dtp.last_ctrl_seq_num_rcvd,
        ack_nack_seq_num,
        new_rwe: dtp.rcv_rwe,
        new_lwe: dtp.rcv_lwe,
        my_rwe: dtp.snd_rwe,
        my_lwe: dtp.snd_lwe,
    };

    let mut pdu = PduBuf::with_headroom(PCI_CTRL_LEN, &[]);
    let mut hdr: &mut [u8] = pdu
        .push_header(PCI_CTRL_LEN)
        .expect("freshly allocated control buffer has exact headroom");
    pcic.ser(&mut hdr);
    pdu
}

/// Called after `rcv_lwe` may have advanced: refreshes the advertised
/// window and returns the control PDU the peer should see, if any.
pub(crate) fn sv_update(flow: &Flow, own_addr: Address, dtp: &mut DtpState) -> Option<PduBuf> {
    let cfg = &flow.cfg.dtcp;

    if cfg.flow_control && cfg.fc.fc_type == FcType::Window {
        // The credit is re-extended from the new left edge. A buffer-aware
        // policy would consult receiver memory here instead.
        let new_rwe = dtp.rcv_lwe.wrapping_add(cfg.fc.window.initial_credit);
        trace!("rcv_rwe [{}] --> [{}]", dtp.rcv_rwe, new_rwe);
        dtp.rcv_rwe = new_rwe;
    }

    let mut pdu_type = 0u8;
    let mut ack_nack_seq_num = 0;
    if cfg.rtx_control {
        ack_nack_seq_num = dtp.rcv_lwe.wrapping_sub(1);
        pdu_type = PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK;
        if cfg.flow_control {
            pdu_type |= PDU_T_FC_BIT;
        }
    } else if cfg.flow_control {
        pdu_type = PDU_T_CTRL_MASK | PDU_T_FC_BIT;
    }

    (pdu_type != 0).then(|| ctrl_pdu(flow, own_addr, dtp, pdu_type, ack_nack_seq_num))
}

impl Flow {
    /// Applies an incoming control PDU: control-sequence bookkeeping,
    /// window update with closed-window drain, then the acknowledgement
    /// policy for the subtype. PDUs drained from the closed-window queue
    /// are transmitted after the lock is released, and blocked writers are
    /// woken.
    pub(crate) async fn sdu_rx_ctrl(self: &Arc<Self>, ipcp: &Arc<Ipcp>, pdu: PduBuf) {
        let pcic = match PciCtrl::parse(pdu.as_ref()) {
            Ok(pcic) => pcic,
            Err(e) => {
                warn!("dropping control PDU with unparsable header: {e}");
                return;
            }
        };
        if !is_ctrl(pcic.base.pdu_type) {
            error!("unknown PDU type {:#04x}", pcic.base.pdu_type);
            return;
        }

        let mut drained = Vec::new();
        {
            let mut dtp = self.dtp.lock().await;
            let seqnum = pcic.base.seqnum;

            if dtp.last_ctrl_seq_num_rcvd != 0 && seqnum <= dtp.last_ctrl_seq_num_rcvd {
                debug!(
                    "duplicated control PDU [{seqnum}], last [{}]",
                    dtp.last_ctrl_seq_num_rcvd
                );
            } else {
                if seqnum > dtp.last_ctrl_seq_num_rcvd.wrapping_add(1) {
                    // Gap in the control sequence space; a lost-control-PDU
                    // policy would react here.
                    debug!(
                        "lost control PDUs: [{}] --> [{seqnum}]",
                        dtp.last_ctrl_seq_num_rcvd
                    );
                }
                dtp.last_ctrl_seq_num_rcvd = seqnum;

                if pcic.base.pdu_type & PDU_T_FC_BIT != 0 {
                    self.apply_window_update(&mut dtp, &pcic, &mut drained);
                }

                if pcic.base.pdu_type & PDU_T_ACK_BIT != 0 {
                    let policy = ack_policy(pcic.base.pdu_type);
                    if let Some(deadline) = policy.on_ctrl(&mut dtp, &pcic) {
                        self.arm_rtx(&mut dtp, deadline);
                    }
                }
            }
        }

        for qpdu in drained {
            trace!("sending [{}] from cwq", qpdu.seqnum);
            crate::rmt::rmt_tx(ipcp, self.remote_addr, qpdu.pdu, false)
                .await
                .ok();
        }

        // The window may have opened; let blocked writers retry.
        self.write_ready.notify_waiters();
    }

    /// Moves the sender right edge forward and pops everything the new
    /// window admits out of the closed-window queue.
    fn apply_window_update(
        self: &Arc<Self>,
        dtp: &mut DtpState,
        pcic: &PciCtrl,
        drained: &mut Vec<crate::dtp::QueuedPdu>,
    ) {
        if pcic.new_rwe < dtp.snd_rwe {
            warn!(
                "broken peer, new_rwe would go backward [{}] --> [{}]",
                dtp.snd_rwe, pcic.new_rwe
            );
            return;
        }
        trace!("snd_rwe [{}] --> [{}]", dtp.snd_rwe, pcic.new_rwe);
        dtp.snd_rwe = pcic.new_rwe;

        while dtp.snd_lwe < dtp.snd_rwe {
            let Some(qpdu) = dtp.cwq.pop_front() else {
                break;
            };
            dtp.last_seq_num_sent = Some(dtp.snd_lwe);
            dtp.snd_lwe = dtp.snd_lwe.wrapping_add(1);
            if self.cfg.dtcp.rtx_control {
                self.rtxq_push(dtp, qpdu.seqnum, &qpdu.pdu);
            }
            drained.push(qpdu);
        }
    }
}

/// Acknowledgement handling for one subtype of the type mask. Runs under
/// the flow lock; returns a deadline when the retransmission timer must be
/// re-armed.
pub(crate) trait AckSubtypePolicy: Send + Sync {
    fn on_ctrl(&self, dtp: &mut DtpState, pcic: &PciCtrl) -> Option<Instant>;
}

/// Positive acknowledgement: everything at or below the acked sequence
/// number leaves the retransmission queue.
struct PositiveAck;

impl AckSubtypePolicy for PositiveAck {
    fn on_ctrl(&self, dtp: &mut DtpState, pcic: &PciCtrl) -> Option<Instant> {
        let ack = pcic.ack_nack_seq_num;

        if dtp.rtx_tmr_next.is_some_and(|seqnum| seqnum <= ack) {
            // The entry the timer was armed on is acked; re-arm on the new
            // head below, if one remains.
            dtp.rtx_tmr_next = None;
        }
        let before = dtp.rtxq.len();
        dtp.rtxq.retain(|qpdu| qpdu.seqnum > ack);
        if dtp.rtxq.len() != before {
            trace!("removed {} acked PDUs from rtxq", before - dtp.rtxq.len());
        }

        if dtp.rtxq.is_empty() {
            // Everything has been acked; stop the retransmission timer.
            dtp.rtx_tmr.cancel();
            dtp.rtx_tmr_next = None;
            return None;
        }
        if dtp.rtx_tmr_next.is_none() {
            if let Some(head) = dtp.rtxq.front() {
                dtp.rtx_tmr_next = Some(head.seqnum);
                return head.pdu.rtx_expiry();
            }
        }
        None
    }
}

/// Recognised but not implemented subtypes.
struct UnsupportedAck(&'static str);

impl AckSubtypePolicy for UnsupportedAck {
    fn on_ctrl(&self, _dtp: &mut DtpState, pcic: &PciCtrl) -> Option<Instant> {
        info!(
            "missing support for {} (PDU type {:#04x})",
            self.0, pcic.base.pdu_type
        );
        None
    }
}

static POSITIVE_ACK: PositiveAck = PositiveAck;
static NACK: UnsupportedAck = UnsupportedAck("NACK");
static SACK: UnsupportedAck = UnsupportedAck("SACK");
static SNACK: UnsupportedAck = UnsupportedAck("SNACK");

pub(crate) fn ack_policy(pdu_type: u8) -> &'static dyn AckSubtypePolicy {
    match pdu_type & PDU_T_ACK_MASK {
        PDU_T_NACK => &NACK,
        PDU_T_SACK => &SACK,
        PDU_T_SNACK => &SNACK,
        _ => &POSITIVE_ACK,
    }
}
