use super::constants::{
    CQE_SIZE, CQE_TYPE_CUTOFF, CQE_TYPE_REQ, CQE_TYPE_RES_RC, CQE_TYPE_RES_UD, CQE_TYPE_TERMINAL,
    SLOT_SIZE, WQE_HDR_SLOTS, WQE_TYPE_RECV,
};
use crate::types::WcStatus;
use bitfield::bitfield;
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

pub(crate) const CQE_QP_HANDLE_OFFSET: usize = 8;
pub(crate) const CQE_TYPE_TOGGLE_OFFSET: usize = 24;
const CQE_TOGGLE_MASK: u8 = 0x1;

bitfield! {
    /// Send WQE base header. All fields little endian.
    struct SqBaseHdr([u8]);
    u64;
    wqe_type, set_wqe_type: 7, 0;               // 8bits
    flags, set_flags: 15, 8;                    // 8bits
    wqe_size, set_wqe_size: 23, 16;             // 8bits, in slots
    imm_or_key, set_imm_or_key: 63, 32;         // 32bits
    qkey, set_qkey: 95, 64;                     // 32bits, UD only
    length, set_length: 127, 96;                // 32bits
}

bitfield! {
    /// Extended header of a datagram send
    struct UdExtHdr([u8]);
    u64;
    dst_qp, set_dst_qp: 23, 0;                  // 24bits
    avid, set_avid: 83, 64;                     // 20bits
}

bitfield! {
    /// Extended header of RDMA write and read
    struct RdmaExtHdr([u8]);
    u64;
    remote_va, set_remote_va: 63, 0;            // 64bits
    rkey, set_rkey: 95, 64;                     // 32bits
}

bitfield! {
    /// Atomic base header
    struct AtomicHdr([u8]);
    u64;
    rkey, set_rkey: 63, 32;                     // 32bits
    remote_va, set_remote_va: 127, 64;          // 64bits
}

bitfield! {
    /// Atomic extended header
    struct AtomicExtHdr([u8]);
    u64;
    swap, set_swap: 63, 0;                      // 64bits
    compare, set_compare: 127, 64;              // 64bits
}

bitfield! {
    /// Memory window bind base header
    struct BindHdr([u8]);
    u64;
    access, set_access: 27, 24;                 // 4bits
    mw_type2, set_mw_type2: 28;                 // 1bit
    zero_based, set_zero_based: 29;             // 1bit
    parent_key, set_parent_key: 63, 32;         // 32bits
    rkey, set_rkey: 95, 64;                     // 32bits
}

bitfield! {
    /// Memory window bind extended header
    struct BindExtHdr([u8]);
    u64;
    va, set_va: 63, 0;                          // 64bits
    length, set_length: 127, 64;                // 64bits
}

bitfield! {
    /// Scatter gather entry, one slot
    struct SgeLayout([u8]);
    u64;
    va, set_va: 63, 0;                          // 64bits
    lkey, set_lkey: 95, 64;                     // 32bits
    size, set_size: 127, 96;                    // 32bits
}

bitfield! {
    /// Receive WQE header
    struct RqHdr([u8]);
    u64;
    wqe_type, set_wqe_type: 7, 0;               // 8bits
    flags, set_flags: 15, 8;                    // 8bits
    wqe_size, set_wqe_size: 23, 16;             // 8bits, in slots
    wr_idx, set_wr_idx: 95, 64;                 // 32bits, echoed back in the CQE
}

bitfield! {
    /// Fields shared by every CQE
    struct CqeBase([u8]);
    u64;
    qp_handle, set_qp_handle: 127, 64;          // 64bits
    toggle, set_toggle: 192;                    // 1bit
    cqe_type, set_cqe_type: 196, 193;           // 4bits
    status, set_status: 207, 200;               // 8bits
}

bitfield! {
    /// Requester CQE
    struct ReqCqe([u8]);
    u64;
    sq_cons_idx, set_sq_cons_idx: 15, 0;        // 16bits
}

bitfield! {
    /// Reliable connection responder CQE
    struct ResRcCqe([u8]);
    u64;
    length, set_length: 31, 0;                  // 32bits
    imm_or_inv, set_imm_or_inv: 63, 32;         // 32bits
    wr_idx, set_wr_idx: 147, 128;               // 20bits
    flags, set_flags: 175, 160;                 // 16bits
}

bitfield! {
    /// Datagram responder CQE, source QP split in two fields
    struct ResUdCqe([u8]);
    u64;
    length, set_length: 31, 0;                  // 32bits
    imm, set_imm: 63, 32;                       // 32bits
    wr_idx, set_wr_idx: 147, 128;               // 20bits
    src_qp_high, set_src_qp_high: 159, 152;     // 8bits
    flags, set_flags: 175, 160;                 // 16bits
    src_qp_low, set_src_qp_low: 191, 176;       // 16bits
}

bitfield! {
    /// Terminal CQE
    struct TerminalCqe([u8]);
    u64;
    sq_cons_idx, set_sq_cons_idx: 15, 0;        // 16bits
    rq_cons_idx, set_rq_cons_idx: 31, 16;       // 16bits
}

bitfield! {
    /// Legacy PSN search entry
    struct PsnSearch([u8]);
    u64;
    start_psn, set_start_psn: 23, 0;            // 24bits
    opcode, set_opcode: 31, 24;                 // 8bits
    next_psn, set_next_psn: 55, 32;             // 24bits
    start_slot_idx, set_start_slot_idx: 79, 64; // 16bits, extended format only
}

bitfield! {
    /// MSN table entry used with hardware retransmission
    struct MsnSearch([u8]);
    u64;
    start_psn, set_start_psn: 23, 0;            // 24bits
    next_psn, set_next_psn: 47, 24;             // 24bits
    start_idx, set_start_idx: 63, 48;           // 16bits
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CqeFlags: u16 {
        const SRQ = 0x1;
        const IMM = 0x2;
        const INV = 0x4;
        /// Responder side of an RDMA write with immediate.
        const RDMA = 0x8;
        const GRH = 0x10;
        const MULTICAST = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ReqStatus {
    Ok = 0,
    BadResponse = 1,
    LocalLength = 2,
    LocalQpOperation = 3,
    LocalProtection = 4,
    LocalAccess = 5,
    RemoteInvalidRequest = 6,
    RemoteAccess = 7,
    RemoteOperation = 8,
    RnrNakRetryExceeded = 9,
    TransportRetryExceeded = 10,
    WorkRequestFlushed = 11,
    MemoryManagement = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResStatus {
    Ok = 0,
    LocalAccess = 1,
    LocalLength = 2,
    LocalProtection = 3,
    LocalQpOperation = 4,
    MemoryManagement = 5,
    RemoteInvalidRequest = 6,
    WorkRequestFlushed = 7,
    /// Hardware flushed the entry while the QP was already in error.
    HwFlush = 8,
}

/// Requester status as seen by the application.
pub(crate) fn req_status_to_wc(status: u8) -> WcStatus {
    match ReqStatus::try_from(status) {
        Ok(ReqStatus::Ok) => WcStatus::Success,
        Ok(ReqStatus::BadResponse) => WcStatus::BadRespErr,
        Ok(ReqStatus::LocalLength) => WcStatus::LocLenErr,
        Ok(ReqStatus::LocalQpOperation) => WcStatus::LocQpOpErr,
        Ok(ReqStatus::LocalProtection) => WcStatus::LocProtErr,
        Ok(ReqStatus::LocalAccess) => WcStatus::LocAccessErr,
        Ok(ReqStatus::RemoteInvalidRequest) => WcStatus::RemInvReqErr,
        Ok(ReqStatus::RemoteAccess) => WcStatus::RemAccessErr,
        Ok(ReqStatus::RemoteOperation) => WcStatus::RemOpErr,
        Ok(ReqStatus::RnrNakRetryExceeded) => WcStatus::RnrRetryExcErr,
        Ok(ReqStatus::TransportRetryExceeded) => WcStatus::RetryExcErr,
        Ok(ReqStatus::WorkRequestFlushed) => WcStatus::WrFlushErr,
        Ok(ReqStatus::MemoryManagement) => WcStatus::MwBindErr,
        Err(_) => WcStatus::GeneralErr,
    }
}

/// Responder status as seen by the application.
pub(crate) fn res_status_to_wc(status: u8) -> WcStatus {
    match ResStatus::try_from(status) {
        Ok(ResStatus::Ok) => WcStatus::Success,
        Ok(ResStatus::LocalAccess) => WcStatus::LocAccessErr,
        Ok(ResStatus::LocalLength) => WcStatus::LocLenErr,
        Ok(ResStatus::LocalProtection) => WcStatus::LocProtErr,
        Ok(ResStatus::LocalQpOperation) => WcStatus::LocQpOpErr,
        Ok(ResStatus::MemoryManagement) => WcStatus::MwBindErr,
        Ok(ResStatus::RemoteInvalidRequest) => WcStatus::RemInvReqErr,
        Ok(ResStatus::WorkRequestFlushed) | Ok(ResStatus::HwFlush) => WcStatus::WrFlushErr,
        Err(_) => WcStatus::GeneralErr,
    }
}

/// Opcode specific header of a send WQE. Covers the base and extended header
/// slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqWqeHdr {
    Send {
        wqe_type: u8,
        imm_or_inv: u32,
        length: u32,
        ud: Option<UdFields>,
    },
    Rdma {
        wqe_type: u8,
        imm: u32,
        length: u32,
        remote_va: u64,
        rkey: u32,
    },
    Atomic {
        wqe_type: u8,
        remote_va: u64,
        rkey: u32,
        swap: u64,
        compare: u64,
    },
    LocalInv {
        wqe_type: u8,
        key: u32,
    },
    Bind {
        wqe_type: u8,
        access: u8,
        zero_based: bool,
        parent_key: u32,
        rkey: u32,
        va: u64,
        length: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UdFields {
    pub(crate) qkey: u32,
    pub(crate) dst_qp: u32,
    pub(crate) avid: u32,
}

impl SqWqeHdr {
    /// Write both header slots into `dst`.
    pub(crate) fn write(&self, dst: &mut [u8], flags: u8, wqe_slots: u8) {
        let (base, ext) = dst[..WQE_HDR_SLOTS as usize * SLOT_SIZE].split_at_mut(SLOT_SIZE);
        base.fill(0);
        ext.fill(0);

        let mut hdr = SqBaseHdr(&mut *base);
        hdr.set_flags(flags as u64);
        hdr.set_wqe_size(wqe_slots as u64);

        match *self {
            SqWqeHdr::Send {
                wqe_type,
                imm_or_inv,
                length,
                ud,
            } => {
                hdr.set_wqe_type(wqe_type as u64);
                hdr.set_imm_or_key(imm_or_inv as u64);
                hdr.set_length(length as u64);
                if let Some(ud) = ud {
                    hdr.set_qkey(ud.qkey as u64);
                    let mut ext = UdExtHdr(ext);
                    ext.set_dst_qp(ud.dst_qp as u64);
                    ext.set_avid(ud.avid as u64);
                }
            }
            SqWqeHdr::Rdma {
                wqe_type,
                imm,
                length,
                remote_va,
                rkey,
            } => {
                hdr.set_wqe_type(wqe_type as u64);
                hdr.set_imm_or_key(imm as u64);
                hdr.set_length(length as u64);
                let mut ext = RdmaExtHdr(ext);
                ext.set_remote_va(remote_va);
                ext.set_rkey(rkey as u64);
            }
            SqWqeHdr::Atomic {
                wqe_type,
                remote_va,
                rkey,
                swap,
                compare,
            } => {
                hdr.set_wqe_type(wqe_type as u64);
                let mut atomic = AtomicHdr(&mut *base);
                atomic.set_rkey(rkey as u64);
                atomic.set_remote_va(remote_va);
                let mut ext = AtomicExtHdr(ext);
                ext.set_swap(swap);
                ext.set_compare(compare);
            }
            SqWqeHdr::LocalInv { wqe_type, key } => {
                hdr.set_wqe_type(wqe_type as u64);
                hdr.set_imm_or_key(key as u64);
            }
            SqWqeHdr::Bind {
                wqe_type,
                access,
                zero_based,
                parent_key,
                rkey,
                va,
                length,
            } => {
                hdr.set_wqe_type(wqe_type as u64);
                let mut bind = BindHdr(&mut *base);
                bind.set_access(access as u64);
                bind.set_mw_type2(true);
                bind.set_zero_based(zero_based);
                bind.set_parent_key(parent_key as u64);
                bind.set_rkey(rkey as u64);
                let mut ext = BindExtHdr(ext);
                ext.set_va(va);
                ext.set_length(length);
            }
        }
    }
}

/// Decoded common part of a send WQE base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqWqeView {
    pub wqe_type: u8,
    pub flags: u8,
    pub wqe_slots: u8,
    pub imm_or_key: u32,
    pub qkey: u32,
    pub length: u32,
}

impl SqWqeView {
    pub fn parse(src: &[u8]) -> Self {
        let hdr = SqBaseHdr(src);
        Self {
            wqe_type: hdr.wqe_type() as u8,
            flags: hdr.flags() as u8,
            wqe_slots: hdr.wqe_size() as u8,
            imm_or_key: hdr.imm_or_key() as u32,
            qkey: hdr.qkey() as u32,
            length: hdr.length() as u32,
        }
    }

    /// Remote address and key from the extended header of an RDMA WQE.
    pub fn parse_rdma_ext(src: &[u8]) -> (u64, u32) {
        let ext = RdmaExtHdr(src);
        (ext.remote_va(), ext.rkey() as u32)
    }

    /// Destination QP and address handle id of a datagram WQE.
    pub fn parse_ud_ext(src: &[u8]) -> (u32, u32) {
        let ext = UdExtHdr(src);
        (ext.dst_qp() as u32, ext.avid() as u32)
    }

    /// Swap and compare operands of an atomic WQE.
    pub fn parse_atomic_ext(src: &[u8]) -> (u64, u64) {
        let ext = AtomicExtHdr(src);
        (ext.swap(), ext.compare())
    }
}

pub(crate) fn write_sge(dst: &mut [u8], va: u64, lkey: u32, size: u32) {
    let mut sge = SgeLayout(dst);
    sge.set_va(va);
    sge.set_lkey(lkey as u64);
    sge.set_size(size as u64);
}

/// Returns (va, lkey, size).
pub fn parse_sge(src: &[u8]) -> (u64, u32, u32) {
    let sge = SgeLayout(src);
    (sge.va(), sge.lkey() as u32, sge.size() as u32)
}

/// Both receive header slots.
pub(crate) fn write_rq_hdr(dst: &mut [u8], wqe_slots: u8, wr_idx: u32) {
    let hdr = &mut dst[..WQE_HDR_SLOTS as usize * SLOT_SIZE];
    hdr.fill(0);
    let mut hdr = RqHdr(hdr);
    hdr.set_wqe_type(WQE_TYPE_RECV as u64);
    hdr.set_wqe_size(wqe_slots as u64);
    hdr.set_wr_idx(wr_idx as u64);
}

/// Returns (wqe type, slots, wr index).
pub fn parse_rq_hdr(src: &[u8]) -> (u8, u8, u32) {
    let hdr = RqHdr(src);
    (
        hdr.wqe_type() as u8,
        hdr.wqe_size() as u8,
        hdr.wr_idx() as u32,
    )
}

/// Sequence number bookkeeping entry format, chosen by chip generation and
/// retransmission capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PsnSearchFormat {
    Legacy,
    Extended,
    Msn,
}

impl PsnSearchFormat {
    pub(crate) fn entry_size(self) -> usize {
        match self {
            PsnSearchFormat::Legacy | PsnSearchFormat::Msn => 8,
            PsnSearchFormat::Extended => 16,
        }
    }

    pub(crate) fn write(
        self,
        dst: &mut [u8],
        opcode: u8,
        start_psn: u32,
        next_psn: u32,
        start_slot_idx: u16,
    ) {
        dst.fill(0);
        match self {
            PsnSearchFormat::Legacy | PsnSearchFormat::Extended => {
                let mut entry = PsnSearch(dst);
                entry.set_start_psn(start_psn as u64);
                entry.set_opcode(opcode as u64);
                entry.set_next_psn(next_psn as u64);
                if self == PsnSearchFormat::Extended {
                    entry.set_start_slot_idx(start_slot_idx as u64);
                }
            }
            PsnSearchFormat::Msn => {
                let mut entry = MsnSearch(dst);
                entry.set_start_psn(start_psn as u64);
                entry.set_next_psn(next_psn as u64);
                entry.set_start_idx(start_slot_idx as u64);
            }
        }
    }

    /// Returns (start psn, next psn).
    #[cfg(test)]
    pub(crate) fn parse(self, src: &[u8]) -> (u32, u32) {
        match self {
            PsnSearchFormat::Legacy | PsnSearchFormat::Extended => {
                let entry = PsnSearch(src);
                (entry.start_psn() as u32, entry.next_psn() as u32)
            }
            PsnSearchFormat::Msn => {
                let entry = MsnSearch(src);
                (entry.start_psn() as u32, entry.next_psn() as u32)
            }
        }
    }
}

/// A decoded completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cqe {
    Req {
        qp_handle: u64,
        sq_cons_idx: u16,
        status: u8,
    },
    ResRc {
        qp_handle: u64,
        length: u32,
        imm_or_inv: u32,
        wr_idx: u32,
        flags: u16,
        status: u8,
    },
    ResUd {
        qp_handle: u64,
        length: u32,
        imm: u32,
        wr_idx: u32,
        flags: u16,
        src_qp: u32,
        status: u8,
    },
    Terminal {
        qp_handle: u64,
        sq_cons_idx: u16,
        rq_cons_idx: u16,
        status: u8,
    },
    Cutoff {
        status: u8,
    },
    Unknown {
        cqe_type: u8,
    },
}

/// Valid when the toggle bit differs from the consumer epoch.
pub(crate) fn cqe_is_valid(type_toggle: u8, cons_epoch: bool) -> bool {
    ((type_toggle & CQE_TOGGLE_MASK) != 0) != cons_epoch
}

impl Cqe {
    pub fn parse(src: &[u8]) -> Self {
        let base = CqeBase(src);
        let qp_handle = base.qp_handle();
        let status = base.status() as u8;
        match base.cqe_type() as u8 {
            CQE_TYPE_REQ => Cqe::Req {
                qp_handle,
                sq_cons_idx: ReqCqe(src).sq_cons_idx() as u16,
                status,
            },
            CQE_TYPE_RES_RC => {
                let cqe = ResRcCqe(src);
                Cqe::ResRc {
                    qp_handle,
                    length: cqe.length() as u32,
                    imm_or_inv: cqe.imm_or_inv() as u32,
                    wr_idx: cqe.wr_idx() as u32,
                    flags: cqe.flags() as u16,
                    status,
                }
            }
            CQE_TYPE_RES_UD => {
                let cqe = ResUdCqe(src);
                Cqe::ResUd {
                    qp_handle,
                    length: cqe.length() as u32,
                    imm: cqe.imm() as u32,
                    wr_idx: cqe.wr_idx() as u32,
                    flags: cqe.flags() as u16,
                    src_qp: ((cqe.src_qp_high() as u32) << 16) | cqe.src_qp_low() as u32,
                    status,
                }
            }
            CQE_TYPE_TERMINAL => {
                let cqe = TerminalCqe(src);
                Cqe::Terminal {
                    qp_handle,
                    sq_cons_idx: cqe.sq_cons_idx() as u16,
                    rq_cons_idx: cqe.rq_cons_idx() as u16,
                    status,
                }
            }
            CQE_TYPE_CUTOFF => Cqe::Cutoff { status },
            cqe_type => Cqe::Unknown { cqe_type },
        }
    }

    /// Encode as the device would, with the given validity toggle.
    pub fn write(&self, dst: &mut [u8], toggle: bool) {
        let dst = &mut dst[..CQE_SIZE];
        dst.fill(0);
        let (cqe_type, qp_handle, status) = match *self {
            Cqe::Req {
                qp_handle,
                sq_cons_idx,
                status,
            } => {
                ReqCqe(&mut *dst).set_sq_cons_idx(sq_cons_idx as u64);
                (CQE_TYPE_REQ, qp_handle, status)
            }
            Cqe::ResRc {
                qp_handle,
                length,
                imm_or_inv,
                wr_idx,
                flags,
                status,
            } => {
                let mut cqe = ResRcCqe(&mut *dst);
                cqe.set_length(length as u64);
                cqe.set_imm_or_inv(imm_or_inv as u64);
                cqe.set_wr_idx(wr_idx as u64);
                cqe.set_flags(flags as u64);
                (CQE_TYPE_RES_RC, qp_handle, status)
            }
            Cqe::ResUd {
                qp_handle,
                length,
                imm,
                wr_idx,
                flags,
                src_qp,
                status,
            } => {
                let mut cqe = ResUdCqe(&mut *dst);
                cqe.set_length(length as u64);
                cqe.set_imm(imm as u64);
                cqe.set_wr_idx(wr_idx as u64);
                cqe.set_flags(flags as u64);
                cqe.set_src_qp_high(((src_qp >> 16) & 0xff) as u64);
                cqe.set_src_qp_low((src_qp & 0xffff) as u64);
                (CQE_TYPE_RES_UD, qp_handle, status)
            }
            Cqe::Terminal {
                qp_handle,
                sq_cons_idx,
                rq_cons_idx,
                status,
            } => {
                let mut cqe = TerminalCqe(&mut *dst);
                cqe.set_sq_cons_idx(sq_cons_idx as u64);
                cqe.set_rq_cons_idx(rq_cons_idx as u64);
                (CQE_TYPE_TERMINAL, qp_handle, status)
            }
            Cqe::Cutoff { status } => (CQE_TYPE_CUTOFF, 0, status),
            Cqe::Unknown { cqe_type } => (cqe_type, 0, 0),
        };
        let mut base = CqeBase(dst);
        base.set_qp_handle(qp_handle);
        base.set_cqe_type(cqe_type as u64);
        base.set_status(status as u64);
        base.set_toggle(toggle);
    }
}
