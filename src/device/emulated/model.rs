use crate::{
    device::{
        constants::{CQE_CONS_IDX_NONE, CQE_SIZE, SLOT_SIZE, WQE_HDR_SLOTS},
        types::{parse_rq_hdr, parse_sge, Cqe, CqeFlags, SqWqeView, CQE_TYPE_TOGGLE_OFFSET},
        DmaRegion, RingInfo,
    },
    types::{QpState, QpType},
};
use std::collections::VecDeque;

/// A send WQE the emulated device fetched from a send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedSend {
    pub hdr: SqWqeView,
    /// Every slot of the WQE, header included.
    pub bytes: Vec<u8>,
}

impl PostedSend {
    /// Scatter/gather entries as (address, key, length).
    pub fn sges(&self) -> Vec<(u64, u32, u32)> {
        self.bytes
            .chunks(SLOT_SIZE)
            .skip(WQE_HDR_SLOTS as usize)
            .map(parse_sge)
            .collect()
    }
}

/// A receive WQE the emulated device fetched from a receive queue or SRQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedRecv {
    /// Index the device echoes back in the completion.
    pub wr_idx: u32,
    pub sges: Vec<(u64, u32, u32)>,
}

/// Outcome the emulated device reports for one receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvCompletion {
    /// Raw responder status, 0 is success.
    pub status: u8,
    pub length: u32,
    /// Immediate data in network order, as carried on the wire.
    pub imm: Option<u32>,
    pub invalidated_rkey: Option<u32>,
    /// The immediate came with an RDMA write.
    pub rdma: bool,
    pub src_qp: u32,
    pub grh: bool,
    pub multicast: bool,
}

impl RecvCompletion {
    pub fn success(length: u32) -> Self {
        Self {
            length,
            ..Default::default()
        }
    }

    pub(super) fn flags(&self, srq: bool) -> CqeFlags {
        let mut flags = CqeFlags::empty();
        flags.set(CqeFlags::SRQ, srq);
        flags.set(CqeFlags::IMM, self.imm.is_some());
        flags.set(CqeFlags::INV, self.invalidated_rkey.is_some());
        flags.set(CqeFlags::RDMA, self.rdma);
        flags.set(CqeFlags::GRH, self.grh);
        flags.set(CqeFlags::MULTICAST, self.multicast);
        flags
    }

    pub(super) fn imm_or_inv(&self) -> u32 {
        self.imm.or(self.invalidated_rkey).unwrap_or(0)
    }
}

/// Device side cursor over a work queue ring.
#[derive(Clone)]
pub(super) struct Fetcher {
    ring: RingInfo,
    index: u32,
    epoch: bool,
}

impl Fetcher {
    pub(super) fn new(ring: RingInfo) -> Self {
        Self {
            ring,
            index: 0,
            epoch: false,
        }
    }

    pub(super) fn reset(&mut self) {
        self.index = 0;
        self.epoch = false;
    }

    fn read_slots(&self, start: u32, count: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; count as usize * SLOT_SIZE];
        for (i, chunk) in bytes.chunks_mut(SLOT_SIZE).enumerate() {
            let slot = (start + i as u32) % self.ring.depth;
            self.ring.region.read(slot as usize * SLOT_SIZE, chunk);
        }
        bytes
    }

    fn advance(&mut self, slots: u32) {
        self.index += slots;
        while self.index >= self.ring.depth {
            self.index -= self.ring.depth;
            self.epoch = !self.epoch;
        }
    }

    /// Fetch WQEs until the cursor reaches the producer position a doorbell
    /// announced. `size_of` reads the WQE size in slots from its header.
    pub(super) fn fetch_until(
        &mut self,
        index: u32,
        epoch: bool,
        size_of: impl Fn(&[u8]) -> u32,
    ) -> Vec<Vec<u8>> {
        let mut wqes = Vec::new();
        for _ in 0..self.ring.depth {
            if self.index == index && self.epoch == epoch {
                break;
            }
            let hdr = self.read_slots(self.index, WQE_HDR_SLOTS);
            let slots = size_of(&hdr);
            if slots == 0 {
                break;
            }
            wqes.push(self.read_slots(self.index, slots));
            self.advance(slots);
        }
        wqes
    }
}

pub(super) fn sq_wqe_slots(hdr: &[u8]) -> u32 {
    u32::from(SqWqeView::parse(hdr).wqe_slots)
}

pub(super) fn rq_wqe_slots(hdr: &[u8]) -> u32 {
    u32::from(parse_rq_hdr(hdr).1)
}

pub(super) fn parse_recv(bytes: &[u8]) -> PostedRecv {
    let (_, _, wr_idx) = parse_rq_hdr(bytes);
    PostedRecv {
        wr_idx,
        sges: bytes
            .chunks(SLOT_SIZE)
            .skip(WQE_HDR_SLOTS as usize)
            .map(parse_sge)
            .collect(),
    }
}

/// Producer side of a completion ring.
pub(super) struct EmuCq {
    ring: RingInfo,
    prod: u32,
    epoch: bool,
}

impl EmuCq {
    pub(super) fn new(ring: RingInfo) -> Self {
        Self {
            ring,
            prod: 0,
            epoch: false,
        }
    }

    /// Write the entry body, then publish it by flipping the toggle bit.
    pub(super) fn push(&mut self, cqe: Cqe) {
        let mut buf = [0u8; CQE_SIZE];
        cqe.write(&mut buf, !self.epoch);
        let offset = self.prod as usize * self.ring.stride as usize;
        let region = &self.ring.region;
        region.write(offset, &buf[..CQE_TYPE_TOGGLE_OFFSET]);
        region.write(
            offset + CQE_TYPE_TOGGLE_OFFSET + 1,
            &buf[CQE_TYPE_TOGGLE_OFFSET + 1..],
        );
        DmaRegion::flush_writes();
        region.write_u8_volatile(offset + CQE_TYPE_TOGGLE_OFFSET, buf[CQE_TYPE_TOGGLE_OFFSET]);

        self.prod += 1;
        if self.prod == self.ring.depth {
            self.prod = 0;
            self.epoch = !self.epoch;
        }
    }

    pub(super) fn switch_ring(&mut self, ring: RingInfo) {
        *self = Self::new(ring);
    }
}

pub(super) struct EmuQp {
    pub(super) handle: u64,
    pub(super) qp_type: QpType,
    pub(super) state: QpState,
    pub(super) send_cq: u32,
    pub(super) recv_cq: u32,
    pub(super) srq: Option<u32>,
    pub(super) sq: Fetcher,
    pub(super) sq_wqe_count: u32,
    pub(super) rq: Option<Fetcher>,
    #[cfg(test)]
    pub(super) psn_search: Option<std::sync::Arc<DmaRegion>>,
    pub(super) sends: VecDeque<PostedSend>,
    pub(super) recvs: VecDeque<PostedRecv>,
    /// Send requests completed so far, modulo the record count.
    pub(super) completed: u32,
}

impl EmuQp {
    pub(super) fn reset(&mut self) {
        self.sq.reset();
        if let Some(rq) = self.rq.as_mut() {
            rq.reset();
        }
        self.sends.clear();
        self.recvs.clear();
        self.completed = 0;
    }

    /// Retire `count` sends and return the consumer index to report.
    pub(super) fn retire_sends(&mut self, count: usize) -> u16 {
        let count = count.min(self.sends.len());
        self.sends.drain(..count);
        self.completed = (self.completed + count as u32) % self.sq_wqe_count;
        self.completed as u16
    }

    pub(super) fn terminal_sq_index(&mut self, done: Option<usize>) -> u16 {
        match done {
            Some(count) => self.retire_sends(count),
            None => CQE_CONS_IDX_NONE,
        }
    }
}

pub(super) struct EmuSrq {
    pub(super) fetcher: Fetcher,
    pub(super) recvs: VecDeque<PostedRecv>,
}
