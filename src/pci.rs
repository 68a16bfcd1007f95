//! PCI - the protocol-control-information header prepended to every PDU.
//!
//! All multi-byte integers are little-endian. The serialized width of the
//! address, CEP-id, QoS-id, length and sequence-number fields is chosen at
//! build time (the "flavour"); in-memory representations always use the
//! widest type so the same code handles every flavour.

use crate::error::EfcpError;
use bytes::{Buf, BufMut};

pub type Address = u64;
pub type CepId = u32;
pub type QosId = u32;
pub type SeqNum = u64;

/// Serialized field widths in bytes. All peers of one DIF must agree.
#[cfg(not(feature = "wide"))]
pub mod widths {
    pub const ADDR: usize = 4;
    pub const CEP: usize = 2;
    pub const QOS: usize = 2;
    pub const LEN: usize = 2;
    pub const SEQ: usize = 4;
}

#[cfg(feature = "wide")]
pub mod widths {
    pub const ADDR: usize = 8;
    pub const CEP: usize = 4;
    pub const QOS: usize = 2;
    pub const LEN: usize = 2;
    pub const SEQ: usize = 8;
}

/// Serialized length of the common PCI.
pub const PCI_LEN: usize =
    2 * widths::ADDR + widths::QOS + 2 * widths::CEP + 1 + 1 + widths::LEN + widths::SEQ;

/// Serialized length of a control PCI: the common PCI followed by six
/// sequence-number-wide fields.
pub const PCI_CTRL_LEN: usize = PCI_LEN + 6 * widths::SEQ;

pub const PDU_T_DT: u8 = 0x80;
pub const PDU_T_MGMT: u8 = 0x40;
pub const PDU_T_CTRL_MASK: u8 = 0xC0;
/// The ack/nack-seq-num field is valid.
pub const PDU_T_ACK_BIT: u8 = 0x04;
/// The window-edge fields are valid.
pub const PDU_T_FC_BIT: u8 = 0x08;
pub const PDU_T_ACK_MASK: u8 = 0x03;
pub const PDU_T_ACK: u8 = 0;
pub const PDU_T_NACK: u8 = 1;
pub const PDU_T_SACK: u8 = 2;
pub const PDU_T_SNACK: u8 = 3;

/// Data Run Flag: this PDU starts a new run, resetting receiver state.
pub const PDU_FLAG_DRF: u8 = 0x01;

pub fn is_ctrl(pdu_type: u8) -> bool {
    pdu_type & PDU_T_CTRL_MASK == PDU_T_CTRL_MASK
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pci {
    pub dst_addr: Address,
    pub src_addr: Address,
    pub qos_id: QosId,
    pub dst_cep: CepId,
    pub src_cep: CepId,
    pub pdu_type: u8,
    pub pdu_flags: u8,
    pub pdu_len: u16,
    pub seqnum: SeqNum,
}

impl Pci {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uint_le(self.dst_addr, widths::ADDR);
        buf.put_uint_le(self.src_addr, widths::ADDR);
        buf.put_uint_le(self.qos_id as u64, widths::QOS);
        buf.put_uint_le(self.dst_cep as u64, widths::CEP);
        buf.put_uint_le(self.src_cep as u64, widths::CEP);
        buf.put_u8(self.pdu_type);
        buf.put_u8(self.pdu_flags);
        buf.put_uint_le(self.pdu_len as u64, widths::LEN);
        buf.put_uint_le(self.seqnum, widths::SEQ);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Pci, EfcpError> {
        if buf.remaining() < PCI_LEN {
            return Err(EfcpError::Truncated {
                need: PCI_LEN,
                have: buf.remaining(),
            });
        }
        Ok(Pci {
            dst_addr: buf.get_uint_le(widths::ADDR),
            src_addr: buf.get_uint_le(widths::ADDR),
            qos_id: buf.get_uint_le(widths::QOS) as QosId,
            dst_cep: buf.get_uint_le(widths::CEP) as CepId,
            src_cep: buf.get_uint_le(widths::CEP) as CepId,
            pdu_type: buf.get_u8(),
            pdu_flags: buf.get_u8(),
            pdu_len: buf.get_uint_le(widths::LEN) as u16,
            seqnum: buf.get_uint_le(widths::SEQ),
        })
    }

    /// Parses the PCI at the front of `bytes` without consuming anything.
    pub fn parse(bytes: &[u8]) -> Result<Pci, EfcpError> {
        let mut bytes = bytes;
        Pci::deser(&mut bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciCtrl {
    pub base: Pci,
    pub last_ctrl_seq_num_rcvd: SeqNum,
    pub ack_nack_seq_num: SeqNum,
    pub new_rwe: SeqNum,
    pub new_lwe: SeqNum,
    pub my_rwe: SeqNum,
    pub my_lwe: SeqNum,
}

impl PciCtrl {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.base.ser(buf);
        buf.put_uint_le(self.last_ctrl_seq_num_rcvd, widths::SEQ);
        buf.put_uint_le(self.ack_nack_seq_num, widths::SEQ);
        buf.put_uint_le(self.new_rwe, widths::SEQ);
        buf.put_uint_le(self.new_lwe, widths::SEQ);
        buf.put_uint_le(self.my_rwe, widths::SEQ);
        buf.put_uint_le(self.my_lwe, widths::SEQ);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PciCtrl, EfcpError> {
        if buf.remaining() < PCI_CTRL_LEN {
            return Err(EfcpError::Truncated {
                need: PCI_CTRL_LEN,
                have: buf.remaining(),
            });
        }
        let base = Pci::deser(buf)?;
        Ok(PciCtrl {
            base,
            last_ctrl_seq_num_rcvd: buf.get_uint_le(widths::SEQ),
            ack_nack_seq_num: buf.get_uint_le(widths::SEQ),
            new_rwe: buf.get_uint_le(widths::SEQ),
            new_lwe: buf.get_uint_le(widths::SEQ),
            my_rwe: buf.get_uint_le(widths::SEQ),
            my_lwe: buf.get_uint_le(widths::SEQ),
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<PciCtrl, EfcpError> {
        let mut bytes = bytes;
        PciCtrl::deser(&mut bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_pci() -> Pci {
        Pci {
            dst_addr: 42,
            src_addr: 7,
            qos_id: 0,
            dst_cep: 513,
            src_cep: 20,
            pdu_type: PDU_T_DT,
            pdu_flags: PDU_FLAG_DRF,
            pdu_len: 96,
            seqnum: 1000,
        }
    }

    #[rstest]
    #[case::zeroed(Pci { dst_addr: 0, src_addr: 0, qos_id: 0, dst_cep: 0, src_cep: 0, pdu_type: PDU_T_MGMT, pdu_flags: 0, pdu_len: 0, seqnum: 0 })]
    #[case::data(sample_pci())]
    fn test_pci_round_trip(#[case] original: Pci) {
        let mut buf = Vec::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PCI_LEN);

        let mut b: &[u8] = &buf;
        let deser = Pci::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_pci_ctrl_round_trip() {
        let original = PciCtrl {
            base: Pci {
                pdu_type: PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_FC_BIT | PDU_T_ACK,
                pdu_flags: 0,
                pdu_len: PCI_CTRL_LEN as u16,
                seqnum: 3,
                ..sample_pci()
            },
            last_ctrl_seq_num_rcvd: 2,
            ack_nack_seq_num: 17,
            new_rwe: 30,
            new_lwe: 18,
            my_rwe: 4,
            my_lwe: 4,
        };

        let mut buf = Vec::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PCI_CTRL_LEN);

        let deser = PciCtrl::parse(&buf).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_truncated() {
        let mut buf = Vec::new();
        sample_pci().ser(&mut buf);
        buf.truncate(PCI_LEN - 1);

        assert!(matches!(
            Pci::parse(&buf),
            Err(EfcpError::Truncated { need, .. }) if need == PCI_LEN
        ));
    }

    #[rstest]
    #[case::dt(PDU_T_DT, false)]
    #[case::mgmt(PDU_T_MGMT, false)]
    #[case::ack(PDU_T_CTRL_MASK | PDU_T_ACK_BIT | PDU_T_ACK, true)]
    #[case::fc(PDU_T_CTRL_MASK | PDU_T_FC_BIT, true)]
    fn test_is_ctrl(#[case] pdu_type: u8, #[case] expected: bool) {
        assert_eq!(is_ctrl(pdu_type), expected);
    }
}
