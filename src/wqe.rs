use crate::{
    device::{
        constants::{
            MAX_MSG_LEN, MAX_SGE_VARIABLE, SLOT_SIZE, WQE_FLAG_INLINE, WQE_FLAG_RD_FENCE, WQE_FLAG_SE,
            WQE_FLAG_SIGNAL, WQE_FLAG_UC_FENCE, WQE_HDR_SLOTS, WQE_TYPE_ATOMIC_CMP_SWAP,
            WQE_TYPE_ATOMIC_FETCH_ADD, WQE_TYPE_BIND_MW, WQE_TYPE_LOCAL_INV, WQE_TYPE_READ,
            WQE_TYPE_SEND, WQE_TYPE_SEND_WITH_IMM, WQE_TYPE_SEND_WITH_INV, WQE_TYPE_WRITE,
            WQE_TYPE_WRITE_WITH_IMM,
        },
        ringbuf::RingQueue,
        types::{write_rq_hdr, write_sge, SqWqeHdr, UdFields},
    },
    types::{QpType, RecvWr, SendFlags, SendOp, SendWr},
    utils::align_up,
    Error,
};

const MAX_WQE_BYTES: usize = (WQE_HDR_SLOTS + MAX_SGE_VARIABLE) as usize * SLOT_SIZE;
/// Remote QKEY with the high bit set selects the QP's own QKEY.
const CONTROLLED_QKEY: u32 = 0x8000_0000;

/// A WQE assembled in host memory, copied into the ring slot by slot.
pub(crate) struct WqeBuf {
    bytes: [u8; MAX_WQE_BYTES],
    slots: u32,
}

impl WqeBuf {
    fn new(slots: u32) -> Self {
        Self {
            bytes: [0; MAX_WQE_BYTES],
            slots,
        }
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> u32 {
        self.slots
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes[..self.slots as usize * SLOT_SIZE]
    }

    fn slot_mut(&mut self, idx: u32) -> &mut [u8] {
        let start = idx as usize * SLOT_SIZE;
        &mut self.bytes[start..start + SLOT_SIZE]
    }

    /// Copy into the ring starting at the producer cursor. Handles wrap.
    pub(crate) fn copy_to_ring(&self, ring: &RingQueue) {
        for (idx, chunk) in self.bytes().chunks(SLOT_SIZE).enumerate() {
            ring.write_slot(idx as u32, chunk);
        }
    }
}

/// Per QP limits a send WQE is checked against.
pub(crate) struct SendLimits {
    pub(crate) qp_type: QpType,
    pub(crate) max_sge: u32,
    pub(crate) max_inline: u32,
    pub(crate) atomics: bool,
    pub(crate) qkey: u32,
    pub(crate) sig_all: bool,
    /// Slots every WQE takes when the queue uses fixed size WQEs.
    pub(crate) fixed_slots: Option<u32>,
}

pub(crate) struct SendWqe {
    pub(crate) buf: WqeBuf,
    /// Ring slots consumed, at least the encoded size.
    pub(crate) ring_slots: u32,
    pub(crate) wqe_type: u8,
    pub(crate) data_len: u32,
    pub(crate) signaled: bool,
}

impl SendWqe {
    /// Whether the request advances the send PSN.
    pub(crate) fn consumes_psn(&self) -> bool {
        !matches!(self.wqe_type, WQE_TYPE_LOCAL_INV | WQE_TYPE_BIND_MW)
    }

    /// Length reported in the requester completion.
    pub(crate) fn completion_len(&self) -> u32 {
        match self.wqe_type {
            WQE_TYPE_READ | WQE_TYPE_ATOMIC_CMP_SWAP | WQE_TYPE_ATOMIC_FETCH_ADD => self.data_len,
            _ => 0,
        }
    }
}

fn validate_send(wr: &SendWr, limits: &SendLimits) -> Result<(), Error> {
    if limits.qp_type == QpType::Ud {
        if !matches!(wr.op, SendOp::Send | SendOp::SendWithImm(_)) {
            return Err(Error::UnsupportedOp(QpType::Ud));
        }
        if wr.ud.is_none() {
            return Err(Error::MissingUdDest);
        }
    }
    if matches!(
        wr.op,
        SendOp::AtomicCmpSwap { .. } | SendOp::AtomicFetchAdd { .. }
    ) && !limits.atomics
    {
        return Err(Error::AtomicsUnsupported);
    }
    let len = wr.payload_len();
    if len > u64::from(MAX_MSG_LEN) {
        return Err(Error::MessageTooLong {
            len,
            max: MAX_MSG_LEN,
        });
    }
    if wr.is_inline() {
        if len > u64::from(limits.max_inline) {
            return Err(Error::InlineTooLarge {
                len: len as u32,
                max: limits.max_inline,
            });
        }
    } else if wr.sg_list.len() > limits.max_sge as usize {
        return Err(Error::TooManySge {
            count: wr.sg_list.len(),
            max: limits.max_sge,
        });
    }
    Ok(())
}

fn hw_flags(wr: &SendWr, signaled: bool) -> u8 {
    let mut flags = 0;
    if signaled {
        flags |= WQE_FLAG_SIGNAL;
    }
    if wr.flags.contains(SendFlags::FENCE) {
        flags |= WQE_FLAG_UC_FENCE;
        if matches!(
            wr.op,
            SendOp::Read { .. } | SendOp::AtomicCmpSwap { .. } | SendOp::AtomicFetchAdd { .. }
        ) {
            flags |= WQE_FLAG_RD_FENCE;
        }
    }
    if wr.flags.contains(SendFlags::SOLICITED) {
        flags |= WQE_FLAG_SE;
    }
    if wr.is_inline() {
        flags |= WQE_FLAG_INLINE;
    }
    flags
}

fn send_hdr(wr: &SendWr, limits: &SendLimits, data_len: u32) -> SqWqeHdr {
    let ud = wr.ud.map(|dest| UdFields {
        qkey: if dest.remote_qkey & CONTROLLED_QKEY != 0 {
            limits.qkey
        } else {
            dest.remote_qkey
        },
        dst_qp: dest.remote_qpn.get(),
        avid: dest.ah_id,
    });
    match wr.op {
        SendOp::Send => SqWqeHdr::Send {
            wqe_type: WQE_TYPE_SEND,
            imm_or_inv: 0,
            length: data_len,
            ud,
        },
        SendOp::SendWithImm(imm) => SqWqeHdr::Send {
            wqe_type: WQE_TYPE_SEND_WITH_IMM,
            imm_or_inv: imm.into_be(),
            length: data_len,
            ud,
        },
        SendOp::SendWithInv(key) => SqWqeHdr::Send {
            wqe_type: WQE_TYPE_SEND_WITH_INV,
            imm_or_inv: key.get(),
            length: data_len,
            ud,
        },
        SendOp::Write { raddr, rkey } => SqWqeHdr::Rdma {
            wqe_type: WQE_TYPE_WRITE,
            imm: 0,
            length: data_len,
            remote_va: raddr,
            rkey: rkey.get(),
        },
        SendOp::WriteWithImm { raddr, rkey, imm } => SqWqeHdr::Rdma {
            wqe_type: WQE_TYPE_WRITE_WITH_IMM,
            imm: imm.into_be(),
            length: data_len,
            remote_va: raddr,
            rkey: rkey.get(),
        },
        SendOp::Read { raddr, rkey } => SqWqeHdr::Rdma {
            wqe_type: WQE_TYPE_READ,
            imm: 0,
            length: data_len,
            remote_va: raddr,
            rkey: rkey.get(),
        },
        SendOp::AtomicCmpSwap {
            raddr,
            rkey,
            compare,
            swap,
        } => SqWqeHdr::Atomic {
            wqe_type: WQE_TYPE_ATOMIC_CMP_SWAP,
            remote_va: raddr,
            rkey: rkey.get(),
            swap,
            compare,
        },
        SendOp::AtomicFetchAdd { raddr, rkey, add } => SqWqeHdr::Atomic {
            wqe_type: WQE_TYPE_ATOMIC_FETCH_ADD,
            remote_va: raddr,
            rkey: rkey.get(),
            swap: add,
            compare: 0,
        },
        SendOp::LocalInv(key) => SqWqeHdr::LocalInv {
            wqe_type: WQE_TYPE_LOCAL_INV,
            key: key.get(),
        },
        SendOp::BindMw {
            parent,
            rkey,
            addr,
            len,
            access,
            zero_based,
        } => SqWqeHdr::Bind {
            wqe_type: WQE_TYPE_BIND_MW,
            access: access.bits(),
            zero_based,
            parent_key: parent.get(),
            rkey: rkey.get(),
            va: addr,
            length: len,
        },
    }
}

/// Validate and encode a send request. Nothing is written to the ring.
pub(crate) fn build_send(wr: &SendWr, limits: &SendLimits) -> Result<SendWqe, Error> {
    validate_send(wr, limits)?;

    // bounded by MAX_MSG_LEN
    let data_len = wr.payload_len() as u32;
    let data_slots = if matches!(wr.op, SendOp::LocalInv(_) | SendOp::BindMw { .. }) {
        0
    } else if wr.is_inline() {
        align_up(data_len, SLOT_SIZE as u32) / SLOT_SIZE as u32
    } else {
        wr.sg_list.len() as u32
    };
    let mut buf = WqeBuf::new(WQE_HDR_SLOTS + data_slots);

    let signaled = limits.sig_all || wr.flags.contains(SendFlags::SIGNALED);
    let hdr = send_hdr(wr, limits, data_len);
    let ring_slots = limits.fixed_slots.unwrap_or(buf.slots).max(buf.slots);
    hdr.write(&mut buf.bytes, hw_flags(wr, signaled), ring_slots as u8);

    if data_slots > 0 {
        let payload = &mut buf.bytes[WQE_HDR_SLOTS as usize * SLOT_SIZE..];
        if wr.is_inline() {
            payload[..wr.inline_data.len()].copy_from_slice(&wr.inline_data);
        } else {
            for (idx, sge) in wr.sg_list.iter().enumerate() {
                let dst = &mut payload[idx * SLOT_SIZE..(idx + 1) * SLOT_SIZE];
                write_sge(dst, sge.addr, sge.key.get(), sge.len);
            }
        }
    }

    let wqe_type = buf.bytes[0];
    Ok(SendWqe {
        buf,
        ring_slots,
        wqe_type,
        data_len,
        signaled,
    })
}

/// Slots a receive WQE needs. A request without SGEs still gets one
/// zero length SGE.
pub(crate) fn recv_wqe_slots(wr: &RecvWr, max_sge: u32) -> Result<u32, Error> {
    if wr.sg_list.len() > max_sge as usize {
        return Err(Error::TooManySge {
            count: wr.sg_list.len(),
            max: max_sge,
        });
    }
    Ok(WQE_HDR_SLOTS + (wr.sg_list.len() as u32).max(1))
}

pub(crate) fn build_recv(wr: &RecvWr, wr_idx: u32, slots: u32) -> WqeBuf {
    let mut buf = WqeBuf::new(slots);
    write_rq_hdr(&mut buf.bytes, slots as u8, wr_idx);
    // a missing SGE stays zeroed
    for (idx, sge) in wr.sg_list.iter().enumerate() {
        write_sge(
            buf.slot_mut(WQE_HDR_SLOTS + idx as u32),
            sge.addr,
            sge.key.get(),
            sge.len,
        );
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::types::{parse_rq_hdr, parse_sge, SqWqeView},
        types::{Imm, Key, Qpn, Sge, UdDest},
    };

    fn limits(qp_type: QpType) -> SendLimits {
        SendLimits {
            qp_type,
            max_sge: 6,
            max_inline: 96,
            atomics: true,
            qkey: 0x1111,
            sig_all: false,
            fixed_slots: None,
        }
    }

    fn sge(len: u32) -> Sge {
        Sge {
            addr: 0x1000,
            len,
            key: Key::new(9),
        }
    }

    #[test]
    fn test_send_with_imm_swaps_byte_order() {
        let wr = SendWr::new(1, SendOp::SendWithImm(Imm::new(0x0102_0304)), vec![sge(64)]);
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();
        let view = SqWqeView::parse(wqe.buf.bytes());

        assert_eq!(wqe.buf.slots(), 3);
        assert_eq!(view.wqe_type, WQE_TYPE_SEND_WITH_IMM);
        assert_eq!(view.imm_or_key, 0x0102_0304u32.to_be());
        assert_eq!(view.flags, WQE_FLAG_SIGNAL);
        assert_eq!(view.length, 64);
        assert_eq!(parse_sge(&wqe.buf.bytes()[32..]), (0x1000, 9, 64));
    }

    #[test]
    fn test_inline_payload_is_copied() {
        let data: Vec<u8> = (0..20).collect();
        let wr = SendWr::new(2, SendOp::Send, vec![]).with_inline(data.clone());
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();

        assert_eq!(wqe.buf.slots(), 4);
        assert_eq!(&wqe.buf.bytes()[32..52], &data[..]);
        assert_ne!(SqWqeView::parse(wqe.buf.bytes()).flags & WQE_FLAG_INLINE, 0);
    }

    #[test]
    fn test_fixed_size_header_reports_fixed_slots() {
        let mut fixed = limits(QpType::Rc);
        fixed.fixed_slots = Some(8);
        fixed.sig_all = true;
        let wr = SendWr::new(10, SendOp::Send, vec![sge(4)]).with_flags(SendFlags::empty());
        let wqe = build_send(&wr, &fixed).unwrap();

        assert_eq!(wqe.ring_slots, 8);
        assert_eq!(wqe.buf.slots(), 3);
        let view = SqWqeView::parse(wqe.buf.bytes());
        assert_eq!(view.wqe_slots, 8);
        assert!(wqe.signaled);
        assert_eq!(view.flags & WQE_FLAG_SIGNAL, WQE_FLAG_SIGNAL);
    }

    #[test]
    fn test_fence_on_read_sets_both_fences() {
        let wr = SendWr::new(
            11,
            SendOp::Read {
                raddr: 0x2000,
                rkey: Key::new(4),
            },
            vec![sge(100)],
        )
        .with_flags(SendFlags::SIGNALED | SendFlags::FENCE | SendFlags::SOLICITED);
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();
        let view = SqWqeView::parse(wqe.buf.bytes());

        assert_eq!(
            view.flags,
            WQE_FLAG_SIGNAL | WQE_FLAG_UC_FENCE | WQE_FLAG_RD_FENCE | WQE_FLAG_SE
        );
        assert_eq!(
            SqWqeView::parse_rdma_ext(&wqe.buf.bytes()[16..]),
            (0x2000, 4)
        );
        assert_eq!(wqe.completion_len(), 100);
    }

    #[test]
    fn test_inline_too_large() {
        let wr = SendWr::new(3, SendOp::Send, vec![]).with_inline(vec![0; 97]);
        assert!(matches!(
            build_send(&wr, &limits(QpType::Rc)),
            Err(Error::InlineTooLarge { len: 97, max: 96 })
        ));
    }

    #[test]
    fn test_message_too_long() {
        let wr = SendWr::new(5, SendOp::Send, vec![sge(0x8000_0000); 2]);
        assert!(matches!(
            build_send(&wr, &limits(QpType::Rc)),
            Err(Error::MessageTooLong {
                len: 0x1_0000_0000,
                max: 0x8000_0000
            })
        ));

        let wr = SendWr::new(6, SendOp::Send, vec![sge(0x4000_0000); 2]);
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();
        assert_eq!(SqWqeView::parse(wqe.buf.bytes()).length, 0x8000_0000);
    }

    #[test]
    fn test_too_many_sge() {
        let wr = SendWr::new(4, SendOp::Send, vec![sge(1); 7]);
        assert!(matches!(
            build_send(&wr, &limits(QpType::Rc)),
            Err(Error::TooManySge { count: 7, max: 6 })
        ));
    }

    #[test]
    fn test_atomics_need_capability() {
        let wr = SendWr::new(
            5,
            SendOp::AtomicFetchAdd {
                raddr: 0,
                rkey: Key::new(1),
                add: 1,
            },
            vec![sge(8)],
        );
        let mut no_atomics = limits(QpType::Rc);
        no_atomics.atomics = false;
        assert!(matches!(
            build_send(&wr, &no_atomics),
            Err(Error::AtomicsUnsupported)
        ));
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();
        assert_eq!(wqe.completion_len(), 8);
    }

    #[test]
    fn test_ud_send_uses_qp_qkey_when_controlled() {
        let dest = UdDest {
            ah_id: 3,
            remote_qpn: Qpn::new(0x42),
            remote_qkey: 0x8000_0000,
        };
        let wr = SendWr::new(6, SendOp::Send, vec![sge(8)]).with_ud(dest);
        let wqe = build_send(&wr, &limits(QpType::Ud)).unwrap();
        let view = SqWqeView::parse(wqe.buf.bytes());
        assert_eq!(view.qkey, 0x1111);
        assert_eq!(SqWqeView::parse_ud_ext(&wqe.buf.bytes()[16..]), (0x42, 3));

        let write = SendWr::new(
            7,
            SendOp::Write {
                raddr: 0,
                rkey: Key::new(1),
            },
            vec![],
        )
        .with_ud(dest);
        assert!(matches!(
            build_send(&write, &limits(QpType::Ud)),
            Err(Error::UnsupportedOp(QpType::Ud))
        ));
    }

    #[test]
    fn test_local_inv_takes_no_psn() {
        let wr = SendWr::new(8, SendOp::LocalInv(Key::new(5)), vec![]);
        let wqe = build_send(&wr, &limits(QpType::Rc)).unwrap();
        assert!(!wqe.consumes_psn());
        assert_eq!(wqe.buf.slots(), 2);
    }

    #[test]
    fn test_recv_synthesizes_placeholder_sge() {
        let wr = RecvWr::new(9, vec![]);
        let slots = recv_wqe_slots(&wr, 6).unwrap();
        assert_eq!(slots, 3);
        let buf = build_recv(&wr, 5, slots);
        assert_eq!(parse_rq_hdr(buf.bytes()), (0x80, 3, 5));
        assert_eq!(parse_sge(&buf.bytes()[32..]), (0, 0, 0));
    }
}
