use crate::{
    doorbell::{DbrRecoveryPage, PacingData},
    types::{QpState, QpType},
    Error,
};
use crossbeam_channel::Receiver;
use std::sync::Arc;

pub(crate) mod constants;
mod dma;
pub mod emulated;
pub mod hardware;
pub(crate) mod ringbuf;
pub(crate) mod types;

pub use self::{
    dma::DmaRegion,
    emulated::{DoorbellRecord, EmulatedDevice, PostedRecv, PostedSend, RecvCompletion},
    hardware::{HardwareConfig, HardwareDevice},
    types::{parse_rq_hdr, parse_sge, Cqe, ReqStatus, ResStatus, SqWqeView},
};

/// Doorbell types as seen in [`DoorbellKey::db_type`](crate::DoorbellKey).
pub mod db_type {
    pub use super::constants::{
        DB_TYPE_CQ as CQ, DB_TYPE_CQ_ARMALL as CQ_ARMALL, DB_TYPE_CQ_ARMENA as CQ_ARMENA,
        DB_TYPE_CQ_ARMSE as CQ_ARMSE, DB_TYPE_CQ_CUTOFF_ACK as CQ_CUTOFF_ACK,
        DB_TYPE_PUSH_END as PUSH_END, DB_TYPE_PUSH_START as PUSH_START, DB_TYPE_RQ as RQ,
        DB_TYPE_SQ as SQ, DB_TYPE_SRQ as SRQ, DB_TYPE_SRQ_ARM as SRQ_ARM,
        DB_TYPE_SRQ_ARMENA as SRQ_ARMENA,
    };
}

use self::constants::{
    FIFO_MAX_DEPTH_LEGACY, FIFO_MAX_DEPTH_P7, FIFO_ROOM_MASK_LEGACY, FIFO_ROOM_MASK_P7,
    FIFO_ROOM_SHIFT_LEGACY, FIFO_ROOM_SHIFT_P7,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGen {
    Legacy,
    P5,
    P7,
}

/// Capabilities reported by the control plane when the device is opened.
#[derive(Debug, Clone)]
pub struct DeviceAttr {
    pub chip_gen: ChipGen,
    /// Early silicon needs an extra SQ doorbell after each push.
    pub early_stepping: bool,
    pub hw_retx: bool,
    pub push: bool,
    /// Largest work request count a QP queue may ask for.
    pub max_qp_wr: u32,
    pub max_srq_wr: u32,
    pub atomics: bool,
    pub drop_recovery: bool,
    pub max_sge: u32,
    /// Slots the firmware keeps between producer and consumer.
    pub q_full_delta: u32,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            chip_gen: ChipGen::P5,
            early_stepping: false,
            hw_retx: false,
            push: false,
            max_qp_wr: 0xffff,
            max_srq_wr: 0xffff,
            atomics: true,
            drop_recovery: true,
            max_sge: 6,
            q_full_delta: 0,
        }
    }
}

/// Layout of the doorbell FIFO room register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FifoParams {
    pub(crate) mask: u32,
    pub(crate) shift: u32,
    pub(crate) max_depth: u32,
}

impl FifoParams {
    pub(crate) fn occupancy(&self, reg: u32) -> u32 {
        self.max_depth
            .saturating_sub((reg & self.mask) >> self.shift)
    }
}

impl DeviceAttr {
    pub(crate) fn fifo(&self) -> FifoParams {
        match self.chip_gen {
            ChipGen::P7 => FifoParams {
                mask: FIFO_ROOM_MASK_P7,
                shift: FIFO_ROOM_SHIFT_P7,
                max_depth: FIFO_MAX_DEPTH_P7,
            },
            ChipGen::Legacy | ChipGen::P5 => FifoParams {
                mask: FIFO_ROOM_MASK_LEGACY,
                shift: FIFO_ROOM_SHIFT_LEGACY,
                max_depth: FIFO_MAX_DEPTH_LEGACY,
            },
        }
    }
}

/// Ring memory handed to the control plane.
#[derive(Clone)]
pub struct RingInfo {
    pub region: Arc<DmaRegion>,
    pub depth: u32,
    pub stride: u32,
    /// Slots per WQE when every WQE has a fixed size.
    pub fixed_wqe_slots: Option<u32>,
}

pub struct CqCreateReq {
    pub handle: u64,
    pub ring: RingInfo,
}

pub struct QpCreateReq {
    pub handle: u64,
    pub qp_type: QpType,
    pub sq: RingInfo,
    pub sq_wqe_count: u32,
    pub psn_search: Option<Arc<DmaRegion>>,
    pub rq: Option<RingInfo>,
    pub rq_wqe_count: u32,
    pub send_cq: u32,
    pub recv_cq: u32,
    pub srq: Option<u32>,
}

pub struct SrqCreateReq {
    pub handle: u64,
    pub ring: RingInfo,
    pub wqe_count: u32,
}

/// Identifier and doorbell page assigned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueResources {
    pub id: u32,
    pub db_page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    DoorbellDrop,
}

/// Kernel mediated control operations. Not part of the fast path.
pub trait ControlPath: Send + Sync {
    fn create_cq(&self, req: &CqCreateReq) -> Result<QueueResources, Error>;
    fn resize_cq(&self, cq_id: u32, ring: &RingInfo) -> Result<(), Error>;
    fn destroy_cq(&self, cq_id: u32) -> Result<(), Error>;
    fn create_qp(&self, req: &QpCreateReq) -> Result<QueueResources, Error>;
    fn modify_qp(&self, qp_id: u32, state: QpState) -> Result<(), Error>;
    fn destroy_qp(&self, qp_id: u32) -> Result<(), Error>;
    fn create_srq(&self, req: &SrqCreateReq) -> Result<QueueResources, Error>;
    fn destroy_srq(&self, srq_id: u32) -> Result<(), Error>;
    /// Drain completions of a kernel owned CQ. Returns how many were drained.
    fn poll_kernel_cq(&self, cq_id: u32) -> Result<usize, Error>;
}

/// Public interface for a device. Can be a real hardware device or an emulation.
pub trait DeviceAdaptor: Send + Sync {
    fn attr(&self) -> &DeviceAttr;
    fn control(&self) -> &dyn ControlPath;

    fn write_doorbell(&self, db_page: u32, key: u64);
    fn read_fifo_register(&self) -> u32;
    /// Copy a WQE into a write combining push buffer.
    fn write_push_buffer(&self, buffer: usize, data: &[u8]);

    fn pacing_data(&self) -> Option<&PacingData>;
    fn recovery_page(&self) -> Option<&DbrRecoveryPage>;
    fn event_channel(&self) -> Option<Receiver<DeviceEvent>>;
    fn ack_event(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_occupancy() {
        let attr = DeviceAttr::default();
        let fifo = attr.fifo();
        let room = 0x100;
        assert_eq!(fifo.occupancy(room << fifo.shift), fifo.max_depth - room);
        assert_eq!(fifo.occupancy(u32::MAX), 0);

        let p7 = DeviceAttr {
            chip_gen: ChipGen::P7,
            ..Default::default()
        };
        assert_eq!(p7.fifo().occupancy(0), FIFO_MAX_DEPTH_P7);
    }
}
