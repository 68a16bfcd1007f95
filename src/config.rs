//! Flow and IPCP configuration.

use crate::pci::SeqNum;
use anyhow::bail;
use std::time::Duration;
use tracing::info;

/// Applied when the DIF does not supply a maximum PDU lifetime.
pub const MPL_MSECS_DEFAULT: u64 = 1000;
/// Applied when retransmission control is on and no initial timeout is given.
pub const RTX_MSECS_DEFAULT: u64 = 1000;
/// Applied when retransmission control is on and no retry budget is given.
pub const DATA_RXMS_MAX_DEFAULT: u32 = 10;

#[derive(Clone, Debug, Default)]
pub struct IpcpConfig {
    /// Maximum PDU lifetime of the DIF. Zero falls back to
    /// [`MPL_MSECS_DEFAULT`] at flow initialisation.
    pub max_pdu_life: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct FlowConfig {
    pub dtcp_present: bool,
    pub in_order_delivery: bool,
    /// Largest tolerated gap in the delivered stream. 0 means reliable,
    /// [`SeqNum::MAX`] means unreliable.
    pub max_sdu_gap: SeqNum,
    pub dtcp: DtcpConfig,
}

#[derive(Clone, Debug, Default)]
pub struct DtcpConfig {
    pub flow_control: bool,
    pub rtx_control: bool,
    /// The A timeout: how long delivery may be delayed waiting for gaps to
    /// fill before PDUs are handed upward anyway.
    pub initial_a: Duration,
    pub fc: FcConfig,
    pub rtx: RtxConfig,
}

#[derive(Clone, Debug, Default)]
pub struct FcConfig {
    pub fc_type: FcType,
    pub window: WindowFcConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FcType {
    #[default]
    None,
    Window,
}

#[derive(Clone, Debug, Default)]
pub struct WindowFcConfig {
    /// Bound on the closed-window queue.
    pub max_cwq_len: usize,
    /// Seed credit for both the send and the receive window.
    pub initial_credit: SeqNum,
}

#[derive(Clone, Debug, Default)]
pub struct RtxConfig {
    /// Initial retransmission timeout.
    pub initial_tr: Duration,
    /// Maximum number of retransmissions of one PDU.
    pub data_rxms_max: u32,
}

impl FlowConfig {
    /// Fills in defaults for zero-valued retransmission parameters, as flow
    /// initialisation expects them.
    pub fn sanitized(mut self) -> FlowConfig {
        if self.dtcp.rtx_control && self.dtcp.rtx.initial_tr.is_zero() {
            info!("fixing initial_tr parameter to {} ms", RTX_MSECS_DEFAULT);
            self.dtcp.rtx.initial_tr = Duration::from_millis(RTX_MSECS_DEFAULT);
        }
        if self.dtcp.rtx_control && self.dtcp.rtx.data_rxms_max == 0 {
            info!("fixing data_rxms_max parameter to {}", DATA_RXMS_MAX_DEFAULT);
            self.dtcp.rtx.data_rxms_max = DATA_RXMS_MAX_DEFAULT;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.dtcp_present {
            if self.dtcp.flow_control || self.dtcp.rtx_control {
                bail!("flow control and retransmission control require DTCP");
            }
            return Ok(());
        }
        if self.dtcp.flow_control && self.dtcp.fc.fc_type == FcType::None {
            bail!("flow control enabled without a flow-control type");
        }
        if self.dtcp.fc.fc_type == FcType::Window && self.dtcp.fc.window.initial_credit == 0 {
            bail!("window flow control with zero initial credit");
        }
        Ok(())
    }

    /// The window sub-config, when window flow control is configured.
    pub fn window(&self) -> Option<&WindowFcConfig> {
        match self.dtcp.fc.fc_type {
            FcType::Window => Some(&self.dtcp.fc.window),
            FcType::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rtx_flow_config(initial_tr: Duration, data_rxms_max: u32) -> FlowConfig {
        FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                rtx_control: true,
                rtx: RtxConfig {
                    initial_tr,
                    data_rxms_max,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case::both_zero(Duration::ZERO, 0, Duration::from_millis(1000), 10)]
    #[case::tr_set(Duration::from_millis(200), 0, Duration::from_millis(200), 10)]
    #[case::both_set(Duration::from_millis(200), 3, Duration::from_millis(200), 3)]
    fn test_sanitized_rtx_defaults(
        #[case] initial_tr: Duration,
        #[case] data_rxms_max: u32,
        #[case] expected_tr: Duration,
        #[case] expected_rxms: u32,
    ) {
        let cfg = rtx_flow_config(initial_tr, data_rxms_max).sanitized();
        assert_eq!(cfg.dtcp.rtx.initial_tr, expected_tr);
        assert_eq!(cfg.dtcp.rtx.data_rxms_max, expected_rxms);
    }

    #[test]
    fn test_sanitized_leaves_non_rtx_flows_alone() {
        let cfg = FlowConfig::default().sanitized();
        assert_eq!(cfg.dtcp.rtx.initial_tr, Duration::ZERO);
        assert_eq!(cfg.dtcp.rtx.data_rxms_max, 0);
    }

    #[test]
    fn test_validate_rejects_window_without_credit() {
        let cfg = FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                flow_control: true,
                fc: FcConfig {
                    fc_type: FcType::Window,
                    window: WindowFcConfig {
                        max_cwq_len: 8,
                        initial_credit: 0,
                    },
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dtcp_features_without_dtcp() {
        let cfg = FlowConfig {
            dtcp_present: false,
            dtcp: DtcpConfig {
                rtx_control: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
