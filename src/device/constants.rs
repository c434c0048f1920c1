/// Bytes per send/receive queue slot.
pub(crate) const SLOT_SIZE: usize = 16;
/// Bytes per completion queue entry.
pub(crate) const CQE_SIZE: usize = 32;
/// Base plus extended header.
pub(crate) const WQE_HDR_SLOTS: u32 = 2;
/// Slots per WQE in static mode.
pub(crate) const STATIC_WQE_SLOTS: u32 = 8;
pub(crate) const MAX_SGE_VARIABLE: u32 = 30;

/// Longest message a single work request may carry.
pub(crate) const MAX_MSG_LEN: u32 = 1 << 31;
pub(crate) const STATIC_MAX_INLINE: u32 = ((STATIC_WQE_SLOTS - WQE_HDR_SLOTS) as usize * SLOT_SIZE) as u32;
pub(crate) const VARIABLE_MAX_INLINE: u32 = (MAX_SGE_VARIABLE as usize * SLOT_SIZE) as u32;

// send queue WQE types
pub(crate) const WQE_TYPE_SEND: u8 = 0x0;
pub(crate) const WQE_TYPE_SEND_WITH_IMM: u8 = 0x1;
pub(crate) const WQE_TYPE_SEND_WITH_INV: u8 = 0x2;
pub(crate) const WQE_TYPE_WRITE: u8 = 0x4;
pub(crate) const WQE_TYPE_WRITE_WITH_IMM: u8 = 0x5;
pub(crate) const WQE_TYPE_READ: u8 = 0x6;
pub(crate) const WQE_TYPE_ATOMIC_CMP_SWAP: u8 = 0x8;
pub(crate) const WQE_TYPE_ATOMIC_FETCH_ADD: u8 = 0xb;
pub(crate) const WQE_TYPE_LOCAL_INV: u8 = 0xc;
pub(crate) const WQE_TYPE_BIND_MW: u8 = 0xe;
// receive queue WQE type
pub(crate) const WQE_TYPE_RECV: u8 = 0x80;

// WQE header flags
pub(crate) const WQE_FLAG_SIGNAL: u8 = 0x1;
pub(crate) const WQE_FLAG_RD_FENCE: u8 = 0x2;
pub(crate) const WQE_FLAG_UC_FENCE: u8 = 0x4;
pub(crate) const WQE_FLAG_SE: u8 = 0x8;
pub(crate) const WQE_FLAG_INLINE: u8 = 0x10;

// CQE types
pub(crate) const CQE_TYPE_REQ: u8 = 0x0;
pub(crate) const CQE_TYPE_RES_RC: u8 = 0x1;
pub(crate) const CQE_TYPE_RES_UD: u8 = 0x2;
pub(crate) const CQE_TYPE_TERMINAL: u8 = 0xe;
pub(crate) const CQE_TYPE_CUTOFF: u8 = 0xf;

/// Terminal CQE index meaning "nothing to retire on this queue".
pub(crate) const CQE_CONS_IDX_NONE: u16 = 0xffff;

// doorbell types
pub const DB_TYPE_SQ: u32 = 0x0;
pub const DB_TYPE_RQ: u32 = 0x1;
pub const DB_TYPE_SRQ: u32 = 0x2;
pub const DB_TYPE_SRQ_ARM: u32 = 0x3;
pub const DB_TYPE_CQ: u32 = 0x4;
pub const DB_TYPE_CQ_ARMSE: u32 = 0x5;
pub const DB_TYPE_CQ_ARMALL: u32 = 0x6;
pub const DB_TYPE_CQ_ARMENA: u32 = 0x7;
pub const DB_TYPE_SRQ_ARMENA: u32 = 0x8;
pub const DB_TYPE_CQ_CUTOFF_ACK: u32 = 0x9;
pub const DB_TYPE_PUSH_START: u32 = 0xc;
pub const DB_TYPE_PUSH_END: u32 = 0xd;

pub(crate) const DB_PATH_ROCE: u32 = 0x1;

/// Shadow key value of a doorbell that was never rung.
pub(crate) const DB_KEY_INVALID: u64 = u64::MAX;

// doorbell FIFO room register layout per chip generation
pub(crate) const FIFO_ROOM_MASK_LEGACY: u32 = 0x1fff_8000;
pub(crate) const FIFO_ROOM_SHIFT_LEGACY: u32 = 15;
pub(crate) const FIFO_MAX_DEPTH_LEGACY: u32 = 0x2c00;
pub(crate) const FIFO_ROOM_MASK_P7: u32 = 0x0fff_8000;
pub(crate) const FIFO_ROOM_SHIFT_P7: u32 = 15;
pub(crate) const FIFO_MAX_DEPTH_P7: u32 = 0x8000;

/// Upper bound of one pacing backoff step in microseconds.
pub(crate) const PACING_MAX_WAIT_US: u32 = 128;
pub(crate) const PACING_PROBABILITY_RANGE: u32 = 0xffff;

pub(crate) const PUSH_BUFFERS_PER_CONTEXT: usize = 64;
