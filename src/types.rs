use bitflags::bitflags;
use std::error::Error as StdError;
use thiserror::Error;

/// Type for `Imm`
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct Imm(u32);
impl Imm {
    pub fn new(imm: u32) -> Self {
        Self(imm)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// The device carries immediate data in network order.
    pub fn into_be(self) -> u32 {
        self.0.to_be()
    }

    pub fn from_be(val: u32) -> Self {
        Self::new(u32::from_be(val))
    }
}

impl From<u32> for Imm {
    fn from(imm: u32) -> Self {
        Self::new(imm)
    }
}

/// `RKey` and `LKey`
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct Key(u32);
impl Key {
    pub fn new(key: u32) -> Self {
        Self(key)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Key {
    fn from(key: u32) -> Self {
        Self::new(key)
    }
}

/// Packet Sequence Number
pub type Psn = ThreeBytesStruct;

/// Queue Pair Number
pub type Qpn = ThreeBytesStruct;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct ThreeBytesStruct(u32);

impl ThreeBytesStruct {
    const WIDTH: usize = 24;
    pub(crate) const MASK: u32 = u32::MAX >> (32 - Self::WIDTH);
    const MAX: u32 = Self::MASK + 1;

    pub fn new(key: u32) -> Self {
        Self(key & Self::MASK)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn wrapping_add(&mut self, rhs: u32) {
        self.0 = ((self.0 as u64 + rhs as u64) % Self::MAX as u64) as u32;
    }
}

impl From<u32> for ThreeBytesStruct {
    fn from(key: u32) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    Rc = 2,
    Ud = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pmtu {
    Mtu256 = 1,
    Mtu512 = 2,
    #[default]
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl From<&Pmtu> for u32 {
    fn from(pmtu: &Pmtu) -> u32 {
        match pmtu {
            Pmtu::Mtu256 => 256,
            Pmtu::Mtu512 => 512,
            Pmtu::Mtu1024 => 1024,
            Pmtu::Mtu2048 => 2048,
            Pmtu::Mtu4096 => 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub key: Key,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        const SIGNALED = 1;
        const FENCE = 2;
        const SOLICITED = 4;
        const INLINE = 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MwAccessFlags: u8 {
        const REMOTE_READ = 2;
        const REMOTE_WRITE = 4;
        const REMOTE_ATOMIC = 8;
    }
}

/// Opcode-specific part of a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Send,
    SendWithImm(Imm),
    SendWithInv(Key),
    Write {
        raddr: u64,
        rkey: Key,
    },
    WriteWithImm {
        raddr: u64,
        rkey: Key,
        imm: Imm,
    },
    Read {
        raddr: u64,
        rkey: Key,
    },
    AtomicCmpSwap {
        raddr: u64,
        rkey: Key,
        compare: u64,
        swap: u64,
    },
    AtomicFetchAdd {
        raddr: u64,
        rkey: Key,
        add: u64,
    },
    LocalInv(Key),
    BindMw {
        parent: Key,
        rkey: Key,
        addr: u64,
        len: u64,
        access: MwAccessFlags,
        zero_based: bool,
    },
}

/// Destination of a datagram send. The address handle id is assigned by the
/// control path when the handle is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdDest {
    pub ah_id: u32,
    pub remote_qpn: Qpn,
    pub remote_qkey: u32,
}

#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub op: SendOp,
    pub sg_list: Vec<Sge>,
    /// Payload copied into the WQE when `SendFlags::INLINE` is set.
    pub inline_data: Vec<u8>,
    pub flags: SendFlags,
    pub ud: Option<UdDest>,
}

impl SendWr {
    pub fn new(wr_id: u64, op: SendOp, sg_list: Vec<Sge>) -> Self {
        Self {
            wr_id,
            op,
            sg_list,
            inline_data: Vec::new(),
            flags: SendFlags::SIGNALED,
            ud: None,
        }
    }

    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_inline(mut self, data: Vec<u8>) -> Self {
        self.inline_data = data;
        self.flags |= SendFlags::INLINE;
        self
    }

    pub fn with_ud(mut self, dest: UdDest) -> Self {
        self.ud = Some(dest);
        self
    }

    pub(crate) fn is_inline(&self) -> bool {
        self.flags.contains(SendFlags::INLINE)
    }

    pub(crate) fn payload_len(&self) -> u64 {
        if self.is_inline() {
            self.inline_data.len() as u64
        } else {
            self.sg_list.iter().map(|sge| u64::from(sge.len)).sum()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        Self { wr_id, sg_list }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    MwBindErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    FatalErr,
    GeneralErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    LocalInv,
    BindMw,
    Recv,
    RecvRdmaWithImm,
}

impl From<&SendOp> for WcOpcode {
    fn from(op: &SendOp) -> Self {
        match op {
            SendOp::Send | SendOp::SendWithImm(_) | SendOp::SendWithInv(_) => WcOpcode::Send,
            SendOp::Write { .. } | SendOp::WriteWithImm { .. } => WcOpcode::RdmaWrite,
            SendOp::Read { .. } => WcOpcode::RdmaRead,
            SendOp::AtomicCmpSwap { .. } => WcOpcode::CompSwap,
            SendOp::AtomicFetchAdd { .. } => WcOpcode::FetchAdd,
            SendOp::LocalInv(_) => WcOpcode::LocalInv,
            SendOp::BindMw { .. } => WcOpcode::BindMw,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WcFlags: u8 {
        const WITH_IMM = 1;
        const WITH_INV = 2;
        const GRH = 4;
        const MULTICAST = 8;
    }
}

/// Application visible result of one work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub qpn: Qpn,
    pub byte_len: u32,
    pub imm: Option<Imm>,
    pub invalidated_rkey: Option<Key>,
    /// Remote QP number of a datagram receive.
    pub src_qp: Option<Qpn>,
    pub flags: WcFlags,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, qpn: Qpn) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            qpn,
            byte_len: 0,
            imm: None,
            invalidated_rkey: None,
            src_qp: None,
            flags: WcFlags::empty(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Device(Box<dyn StdError + Send + Sync>),
    #[error("device is in error state")]
    DeviceErrorState,
    #[error("invalid QP handle")]
    InvalidQp,
    #[error("invalid CQ handle")]
    InvalidCq,
    #[error("invalid SRQ handle")]
    InvalidSrq,
    #[error("CQ in use")]
    CqInUse,
    #[error("SRQ in use")]
    SrqInUse,
    #[error("queue full")]
    QueueFull,
    #[error("{count} SGEs exceed the limit of {max}")]
    TooManySge { count: usize, max: u32 },
    #[error("message of {len} bytes exceeds the limit of {max}")]
    MessageTooLong { len: u64, max: u32 },
    #[error("inline payload of {len} bytes exceeds the limit of {max}")]
    InlineTooLarge { len: u32, max: u32 },
    #[error("atomic operations not supported by device")]
    AtomicsUnsupported,
    #[error("operation not supported on {0:?} QP")]
    UnsupportedOp(QpType),
    #[error("datagram send without destination")]
    MissingUdDest,
    #[error("QP receives through a shared receive queue")]
    QpUsesSrq,
    #[error("QP in state {0:?}")]
    InvalidQpState(QpState),
    #[error("invalid queue depth {0}")]
    InvalidDepth(u32),
    #[error("resize not acknowledged by device")]
    ResizeTimeout,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A batch post stopped at `index`. Requests before it remain posted.
#[derive(Debug, Error)]
#[error("work request {index} rejected: {source}")]
pub struct PostError {
    pub index: usize,
    #[source]
    pub source: Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psn_wraps_at_24_bits() {
        let mut psn = Psn::new(0xff_fffe);
        psn.wrapping_add(3);
        assert_eq!(psn.get(), 1);

        let qpn = Qpn::new(0x1ab_cdef);
        assert_eq!(qpn.get(), 0xab_cdef);
    }

    #[test]
    fn test_imm_byte_order() {
        let imm = Imm::new(0x1122_3344);
        assert_eq!(imm.into_be(), 0x1122_3344u32.to_be());
        assert_eq!(Imm::from_be(imm.into_be()), imm);
    }

    #[test]
    fn test_wc_opcode_from_send_op() {
        let op = SendOp::WriteWithImm {
            raddr: 0,
            rkey: Key::new(1),
            imm: Imm::new(2),
        };
        assert_eq!(WcOpcode::from(&op), WcOpcode::RdmaWrite);
        assert_eq!(WcOpcode::from(&SendOp::LocalInv(Key::new(3))), WcOpcode::LocalInv);
    }
}
