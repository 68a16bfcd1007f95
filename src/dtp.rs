//! Per-flow data-transfer state.
//!
//! [`DtpState`] is the whole DTP block of one flow: sequence numbers,
//! window edges, the closed-window queue (`cwq`), the retransmission queue
//! (`rtxq`), the sequencing queue (`seqq`) and the traffic counters. It is
//! guarded by the flow's lock and only ever manipulated while holding it.
//!
//! Queue discipline:
//! * `cwq` holds PDUs that outran the sender window, in send order.
//! * `rtxq` is sorted by ascending sequence number; along that order the
//!   retransmission expiries are non-decreasing starting from the entry the
//!   timer is armed on.
//! * `seqq` is sorted by ascending sequence number and holds no duplicates;
//!   every entry is above `rcv_lwe_priv`.

use crate::buffer::PduBuf;
use crate::config::{FcType, FlowConfig, MPL_MSECS_DEFAULT};
use crate::pci::SeqNum;
use crate::timers::DtpTimer;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Bound on the retransmission queue.
pub(crate) const MAX_RTXQ_LEN: usize = 64;
/// Bound on the sequencing queue.
pub(crate) const SEQQ_MAX_LEN: usize = 64;

/// Packet, byte and error counters of one flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub tx_pkt: u64,
    pub tx_byte: u64,
    pub tx_err: u64,
    pub rx_pkt: u64,
    pub rx_byte: u64,
    pub rx_err: u64,
}

/// A PDU parked in one of the flow queues, keyed by its sequence number.
pub(crate) struct QueuedPdu {
    pub seqnum: SeqNum,
    pub pdu: PduBuf,
}

pub(crate) struct DtpState {
    /// The next outgoing data PDU starts a new run.
    pub set_drf: bool,
    pub next_seq_num_to_send: SeqNum,
    pub last_seq_num_sent: Option<SeqNum>,
    pub snd_lwe: SeqNum,
    /// First sequence number outside the sender window.
    pub snd_rwe: SeqNum,
    /// Left window edge advertised to the peer.
    pub rcv_lwe: SeqNum,
    /// Edge of data actually delivered upward; never behind `rcv_lwe`.
    pub rcv_lwe_priv: SeqNum,
    pub rcv_rwe: SeqNum,
    pub max_seq_num_rcvd: Option<SeqNum>,
    pub last_snd_data_ack: SeqNum,
    pub next_snd_ctl_seq: SeqNum,
    pub last_ctrl_seq_num_rcvd: SeqNum,

    pub cwq: VecDeque<QueuedPdu>,
    pub max_cwq_len: usize,
    pub rtxq: VecDeque<QueuedPdu>,
    pub max_rtxq_len: usize,
    pub seqq: VecDeque<QueuedPdu>,

    /// Sequence number of the `rtxq` entry whose expiry armed the timer.
    pub rtx_tmr_next: Option<SeqNum>,
    /// Current retransmission interval.
    pub rtx_tmr_int: Duration,
    /// MPL + R + A: basis for the inactivity timer durations.
    pub mpl_r_a: Duration,

    pub stats: FlowStats,

    pub snd_inact_tmr: DtpTimer,
    pub rcv_inact_tmr: DtpTimer,
    pub rtx_tmr: DtpTimer,
}

impl DtpState {
    pub fn new(cfg: &FlowConfig, max_pdu_life: Duration) -> DtpState {
        let mpl = if max_pdu_life.is_zero() {
            info!("fixing MPL to {} ms", MPL_MSECS_DEFAULT);
            Duration::from_millis(MPL_MSECS_DEFAULT)
        } else {
            max_pdu_life
        };
        let r = cfg.dtcp.rtx.initial_tr * cfg.dtcp.rtx.data_rxms_max;
        let mpl_r_a = mpl + r + cfg.dtcp.initial_a;

        let mut snd_rwe = 0;
        let mut rcv_rwe = 0;
        let mut max_cwq_len = 0;
        if cfg.dtcp.fc.fc_type == FcType::Window {
            max_cwq_len = cfg.dtcp.fc.window.max_cwq_len;
            snd_rwe += cfg.dtcp.fc.window.initial_credit;
            rcv_rwe += cfg.dtcp.fc.window.initial_credit;
        }

        DtpState {
            set_drf: true,
            next_seq_num_to_send: 0,
            last_seq_num_sent: None,
            snd_lwe: 0,
            snd_rwe,
            rcv_lwe: 0,
            rcv_lwe_priv: 0,
            rcv_rwe,
            max_seq_num_rcvd: None,
            last_snd_data_ack: 0,
            next_snd_ctl_seq: 0,
            last_ctrl_seq_num_rcvd: 0,
            cwq: VecDeque::new(),
            max_cwq_len,
            rtxq: VecDeque::new(),
            max_rtxq_len: if cfg.dtcp.rtx_control { MAX_RTXQ_LEN } else { 0 },
            seqq: VecDeque::new(),
            rtx_tmr_next: None,
            rtx_tmr_int: cfg.dtcp.rtx.initial_tr,
            mpl_r_a,
            stats: FlowStats::default(),
            snd_inact_tmr: DtpTimer::new(),
            rcv_inact_tmr: DtpTimer::new(),
            rtx_tmr: DtpTimer::new(),
        }
    }

    /// Inserts at the sorted position for the PDU's sequence number.
    /// Duplicates and overflow beyond [`SEQQ_MAX_LEN`] are dropped.
    pub fn seqq_push(&mut self, qpdu: QueuedPdu) {
        if self.seqq.len() >= SEQQ_MAX_LEN {
            debug!("seqq overrun: dropping PDU [{}]", qpdu.seqnum);
            return;
        }
        let mut pos = self.seqq.len();
        for (i, cur) in self.seqq.iter().enumerate() {
            if qpdu.seqnum < cur.seqnum {
                pos = i;
                break;
            }
            if qpdu.seqnum == cur.seqnum {
                debug!("duplicate amongst the gaps [{}] dropped", qpdu.seqnum);
                return;
            }
        }
        trace!("[{}] inserted into seqq", qpdu.seqnum);
        self.seqq.insert(pos, qpdu);
    }

    /// Removes every entry now within `max_sdu_gap` of `rcv_lwe_priv`,
    /// advancing `rcv_lwe_priv` past each. The result is in delivery order.
    pub fn seqq_pop_many(&mut self, max_sdu_gap: SeqNum) -> Vec<QueuedPdu> {
        let mut popped = Vec::new();
        let mut i = 0;
        while i < self.seqq.len() {
            if self.seqq[i].seqnum.wrapping_sub(self.rcv_lwe_priv) <= max_sdu_gap {
                if let Some(qpdu) = self.seqq.remove(i) {
                    self.rcv_lwe_priv = qpdu.seqnum.wrapping_add(1);
                    trace!("[{}] popped out from seqq", qpdu.seqnum);
                    popped.push(qpdu);
                }
            } else {
                i += 1;
            }
        }
        popped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DtcpConfig, FcConfig, RtxConfig, WindowFcConfig};
    use rstest::rstest;

    fn queued(seqnum: SeqNum) -> QueuedPdu {
        QueuedPdu {
            seqnum,
            pdu: PduBuf::with_headroom(0, b"x"),
        }
    }

    fn window_rtx_config() -> FlowConfig {
        FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                flow_control: true,
                rtx_control: true,
                fc: FcConfig {
                    fc_type: FcType::Window,
                    window: WindowFcConfig {
                        max_cwq_len: 8,
                        initial_credit: 4,
                    },
                },
                rtx: RtxConfig {
                    initial_tr: Duration::from_millis(500),
                    data_rxms_max: 5,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_new_derives_windows_and_timeouts() {
        let dtp = DtpState::new(&window_rtx_config(), Duration::from_millis(2000));

        assert!(dtp.set_drf);
        assert_eq!(dtp.snd_rwe, 4);
        assert_eq!(dtp.rcv_rwe, 4);
        assert_eq!(dtp.max_cwq_len, 8);
        assert_eq!(dtp.max_rtxq_len, MAX_RTXQ_LEN);
        assert_eq!(dtp.rtx_tmr_int, Duration::from_millis(500));
        // MPL + initial_tr * data_rxms_max + A = 2000 + 500*5 + 0
        assert_eq!(dtp.mpl_r_a, Duration::from_millis(4500));
    }

    #[test]
    fn test_new_applies_mpl_default() {
        let dtp = DtpState::new(&FlowConfig::default(), Duration::ZERO);
        assert_eq!(dtp.mpl_r_a, Duration::from_millis(MPL_MSECS_DEFAULT));
        assert_eq!(dtp.max_rtxq_len, 0);
        assert_eq!(dtp.snd_rwe, 0);
    }

    #[rstest]
    #[case::ascending(vec![1, 2, 5], vec![1, 2, 5])]
    #[case::descending(vec![5, 2, 1], vec![1, 2, 5])]
    #[case::interleaved(vec![3, 7, 5, 4], vec![3, 4, 5, 7])]
    #[case::duplicate(vec![3, 5, 3], vec![3, 5])]
    fn test_seqq_push_keeps_sorted_unique(
        #[case] input: Vec<SeqNum>,
        #[case] expected: Vec<SeqNum>,
    ) {
        let mut dtp = DtpState::new(&FlowConfig::default(), Duration::ZERO);
        for seqnum in input {
            dtp.seqq_push(queued(seqnum));
        }
        let order: Vec<SeqNum> = dtp.seqq.iter().map(|q| q.seqnum).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_seqq_push_bounded() {
        let mut dtp = DtpState::new(&FlowConfig::default(), Duration::ZERO);
        for seqnum in 0..(SEQQ_MAX_LEN as SeqNum + 10) {
            dtp.seqq_push(queued(seqnum + 1));
        }
        assert_eq!(dtp.seqq.len(), SEQQ_MAX_LEN);
    }

    #[test]
    fn test_seqq_pop_many_contiguous_run() {
        let mut dtp = DtpState::new(&FlowConfig::default(), Duration::ZERO);
        dtp.rcv_lwe_priv = 2;
        for seqnum in [2, 3, 4, 8] {
            dtp.seqq_push(queued(seqnum));
        }

        let popped = dtp.seqq_pop_many(0);
        let order: Vec<SeqNum> = popped.iter().map(|q| q.seqnum).collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert_eq!(dtp.rcv_lwe_priv, 5);
        assert_eq!(dtp.seqq.len(), 1);
    }

    #[test]
    fn test_seqq_pop_many_respects_gap_tolerance() {
        let mut dtp = DtpState::new(&FlowConfig::default(), Duration::ZERO);
        dtp.rcv_lwe_priv = 1;
        for seqnum in [2, 6] {
            dtp.seqq_push(queued(seqnum));
        }

        let popped = dtp.seqq_pop_many(1);
        let order: Vec<SeqNum> = popped.iter().map(|q| q.seqnum).collect();
        // 2 is within the gap of 1; 6 is then 3 past the new edge
        assert_eq!(order, vec![2]);
        assert_eq!(dtp.rcv_lwe_priv, 3);
        assert_eq!(dtp.seqq.len(), 1);
    }
}
