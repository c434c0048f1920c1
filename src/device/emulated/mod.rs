use self::model::{parse_recv, rq_wqe_slots, sq_wqe_slots, EmuCq, EmuQp, EmuSrq, Fetcher};
use super::{
    constants::{DB_TYPE_PUSH_END, DB_TYPE_RQ, DB_TYPE_SQ, DB_TYPE_SRQ, DB_TYPE_SRQ_ARM},
    types::{Cqe, ReqStatus, SqWqeView},
    ControlPath, CqCreateReq, DeviceAdaptor, DeviceAttr, DeviceEvent, QpCreateReq,
    QueueResources, RingInfo, SrqCreateReq,
};
use crate::{
    doorbell::{DbrRecoveryPage, DoorbellKey, PacingData},
    lock,
    types::{QpState, QpType},
    Error,
};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;

mod model;

pub use self::model::{PostedRecv, PostedSend, RecvCompletion};

/// Doorbell page every emulated queue is assigned.
pub const EMULATED_DB_PAGE: u32 = 1;

#[derive(Debug, Error)]
#[error("emulated control command failed")]
struct ControlFailed;

#[derive(Debug, Error)]
#[error("no emulated {kind} with id {id}")]
struct UnknownQueue {
    kind: &'static str,
    id: u32,
}

/// A doorbell as the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellRecord {
    pub db_page: u32,
    pub key: DoorbellKey,
}

/// In-process device model.
///
/// Queues live in plain host memory. Doorbells make the model fetch the
/// posted WQEs, and completions are produced only when the caller asks for
/// them, so a test decides exactly which entries the poller sees. Clones share
/// the same device.
#[derive(Clone)]
pub struct EmulatedDevice(Arc<EmulatedInner>);

struct EmulatedInner {
    attr: DeviceAttr,
    pacing: PacingData,
    recovery: Option<DbrRecoveryPage>,
    events: (Sender<DeviceEvent>, Receiver<DeviceEvent>),
    acked_events: AtomicU32,
    kernel_polls: AtomicU32,
    fail_next_control: AtomicBool,
    state: Mutex<EmulatorState>,
}

#[derive(Default)]
struct EmulatorState {
    next_id: u32,
    doorbells: Vec<DoorbellRecord>,
    pushes: Vec<(usize, Vec<u8>)>,
    fifo_script: VecDeque<u32>,
    suppress_cutoff: bool,
    cqs: HashMap<u32, EmuCq>,
    qps: HashMap<u32, EmuQp>,
    srqs: HashMap<u32, EmuSrq>,
}

impl EmulatorState {
    fn assign_id(&mut self) -> QueueResources {
        self.next_id += 1;
        QueueResources {
            id: self.next_id,
            db_page: EMULATED_DB_PAGE,
        }
    }

    fn qp(&mut self, id: u32) -> Result<&mut EmuQp, Error> {
        self.qps
            .get_mut(&id)
            .ok_or_else(|| unknown("QP", id))
    }

    fn cq(&mut self, id: u32) -> Result<&mut EmuCq, Error> {
        self.cqs
            .get_mut(&id)
            .ok_or_else(|| unknown("CQ", id))
    }

    fn on_doorbell(&mut self, key: DoorbellKey) {
        let id = key.xid();
        match key.db_type() {
            DB_TYPE_SQ | DB_TYPE_PUSH_END => {
                let Some(qp) = self.qps.get_mut(&id) else {
                    return;
                };
                for bytes in qp.sq.fetch_until(key.index(), key.epoch(), sq_wqe_slots) {
                    qp.sends.push_back(PostedSend {
                        hdr: SqWqeView::parse(&bytes),
                        bytes,
                    });
                }
            }
            DB_TYPE_RQ => {
                let Some(qp) = self.qps.get_mut(&id) else {
                    return;
                };
                let Some(rq) = qp.rq.as_mut() else {
                    return;
                };
                for bytes in rq.fetch_until(key.index(), key.epoch(), rq_wqe_slots) {
                    qp.recvs.push_back(parse_recv(&bytes));
                }
            }
            DB_TYPE_SRQ => {
                let Some(srq) = self.srqs.get_mut(&id) else {
                    return;
                };
                for bytes in srq
                    .fetcher
                    .fetch_until(key.index(), key.epoch(), rq_wqe_slots)
                {
                    srq.recvs.push_back(parse_recv(&bytes));
                }
            }
            DB_TYPE_SRQ_ARM => debug!("SRQ {id} armed at {}", key.index()),
            _ => {}
        }
    }
}

fn unknown(kind: &'static str, id: u32) -> Error {
    Error::Device(Box::new(UnknownQueue { kind, id }))
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::with_attr(DeviceAttr::default())
    }

    pub fn with_attr(attr: DeviceAttr) -> Self {
        let recovery = attr.drop_recovery.then(DbrRecoveryPage::default);
        Self(Arc::new(EmulatedInner {
            attr,
            pacing: PacingData::default(),
            recovery,
            events: crossbeam_channel::unbounded(),
            acked_events: AtomicU32::new(0),
            kernel_polls: AtomicU32::new(0),
            fail_next_control: AtomicBool::new(false),
            state: Mutex::new(EmulatorState::default()),
        }))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EmulatorState> {
        lock::lock(&self.0.state)
    }

    fn control_result(&self) -> Result<(), Error> {
        if self.0.fail_next_control.swap(false, Ordering::AcqRel) {
            return Err(Error::Device(Box::new(ControlFailed)));
        }
        Ok(())
    }

    /// Pacing page the kernel would refresh.
    pub fn pacing(&self) -> &PacingData {
        &self.0.pacing
    }

    pub fn recovery(&self) -> Option<&DbrRecoveryPage> {
        self.0.recovery.as_ref()
    }

    /// FIFO occupancy values returned by the next register reads, 0 once
    /// exhausted.
    pub fn script_fifo_occupancy(&self, values: impl IntoIterator<Item = u32>) {
        self.state().fifo_script.extend(values);
    }

    /// Make the next control command fail.
    pub fn fail_next_control(&self) {
        self.0.fail_next_control.store(true, Ordering::Release);
    }

    /// Keep resizes from writing the cutoff entry to the old ring.
    pub fn suppress_cutoff(&self, suppress: bool) {
        self.state().suppress_cutoff = suppress;
    }

    pub fn doorbells(&self) -> Vec<DoorbellRecord> {
        self.state().doorbells.clone()
    }

    pub fn clear_doorbells(&self) {
        self.state().doorbells.clear();
    }

    pub fn pushes(&self) -> Vec<(usize, Vec<u8>)> {
        self.state().pushes.clone()
    }

    pub fn acked_events(&self) -> u32 {
        self.0.acked_events.load(Ordering::Acquire)
    }

    pub fn kernel_polls(&self) -> u32 {
        self.0.kernel_polls.load(Ordering::Acquire)
    }

    pub fn qp_state(&self, qpn: u32) -> Option<QpState> {
        self.state().qps.get(&qpn).map(|qp| qp.state)
    }

    /// Send WQEs fetched and not yet completed, oldest first.
    pub fn posted_sends(&self, qpn: u32) -> Vec<PostedSend> {
        self.state()
            .qps
            .get(&qpn)
            .map(|qp| qp.sends.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Receive WQEs fetched and not yet completed, oldest first.
    pub fn posted_recvs(&self, qpn: u32) -> Vec<PostedRecv> {
        self.state()
            .qps
            .get(&qpn)
            .map(|qp| qp.recvs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn posted_srq_recvs(&self, srq_id: u32) -> Vec<PostedRecv> {
        self.state()
            .srqs
            .get(&srq_id)
            .map(|srq| srq.recvs.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn psn_search(&self, qpn: u32) -> Option<Arc<super::DmaRegion>> {
        self.state()
            .qps
            .get(&qpn)
            .and_then(|qp| qp.psn_search.clone())
    }

    /// Complete the `count` oldest fetched sends with one requester entry.
    /// A non-OK status applies to the last of them.
    pub fn complete_sends(&self, qpn: u32, count: usize, status: ReqStatus) -> Result<(), Error> {
        let mut state = self.state();
        let qp = state.qp(qpn)?;
        let sq_cons_idx = qp.retire_sends(count);
        let (cq, qp_handle) = (qp.send_cq, qp.handle);
        state.cq(cq)?.push(Cqe::Req {
            qp_handle,
            sq_cons_idx,
            status: status as u8,
        });
        Ok(())
    }

    /// Complete the oldest fetched receive of the QP, from its own receive
    /// queue or from its SRQ.
    pub fn complete_recv(&self, qpn: u32, completion: RecvCompletion) -> Result<(), Error> {
        self.complete_recv_nth(qpn, 0, completion)
    }

    /// Complete the `nth` oldest fetched receive. Only an SRQ accepts
    /// completions out of order, a receive queue rejects them.
    pub fn complete_recv_nth(
        &self,
        qpn: u32,
        nth: usize,
        completion: RecvCompletion,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let qp = state.qp(qpn)?;
        let (qp_handle, qp_type, recv_cq, srq) = (qp.handle, qp.qp_type, qp.recv_cq, qp.srq);
        let recv = match srq {
            Some(srq) => state
                .srqs
                .get_mut(&srq)
                .and_then(|srq| srq.recvs.remove(nth)),
            None => state.qp(qpn)?.recvs.remove(nth),
        }
        .ok_or_else(|| unknown("receive", nth as u32))?;

        let flags = completion.flags(srq.is_some()).bits();
        let cqe = match qp_type {
            QpType::Rc => Cqe::ResRc {
                qp_handle,
                length: completion.length,
                imm_or_inv: completion.imm_or_inv(),
                wr_idx: recv.wr_idx,
                flags,
                status: completion.status,
            },
            QpType::Ud => Cqe::ResUd {
                qp_handle,
                length: completion.length,
                imm: completion.imm_or_inv(),
                wr_idx: recv.wr_idx,
                flags,
                src_qp: completion.src_qp,
                status: completion.status,
            },
        };
        state.cq(recv_cq)?.push(cqe);
        Ok(())
    }

    /// Report a fatal QP error. `sends_done` sends still completed
    /// successfully before it, `None` reports no send progress.
    pub fn inject_terminal(&self, qpn: u32, sends_done: Option<usize>) -> Result<(), Error> {
        let mut state = self.state();
        let qp = state.qp(qpn)?;
        let sq_cons_idx = qp.terminal_sq_index(sends_done);
        let (cq, qp_handle) = (qp.send_cq, qp.handle);
        state.cq(cq)?.push(Cqe::Terminal {
            qp_handle,
            sq_cons_idx,
            rq_cons_idx: 0,
            status: 0,
        });
        Ok(())
    }

    /// Write an arbitrary entry to a CQ.
    pub fn inject_cqe(&self, cq_id: u32, cqe: Cqe) -> Result<(), Error> {
        self.state().cq(cq_id)?.push(cqe);
        Ok(())
    }

    /// Bump the drop epoch and wake the recovery task, as the kernel does
    /// after the device lost doorbells.
    pub fn signal_doorbell_drop(&self) {
        if let Some(page) = &self.0.recovery {
            page.epoch.fetch_add(1, Ordering::AcqRel);
        }
        if self.0.events.0.send(DeviceEvent::DoorbellDrop).is_err() {
            debug!("no listener for doorbell drop event");
        }
    }
}

impl DeviceAdaptor for EmulatedDevice {
    fn attr(&self) -> &DeviceAttr {
        &self.0.attr
    }

    fn control(&self) -> &dyn ControlPath {
        self
    }

    fn write_doorbell(&self, db_page: u32, key: u64) {
        let key = DoorbellKey::from_raw(key);
        let mut state = self.state();
        state.doorbells.push(DoorbellRecord { db_page, key });
        state.on_doorbell(key);
    }

    fn read_fifo_register(&self) -> u32 {
        let occupancy = self.state().fifo_script.pop_front().unwrap_or(0);
        let fifo = self.0.attr.fifo();
        (fifo.max_depth.saturating_sub(occupancy) << fifo.shift) & fifo.mask
    }

    fn write_push_buffer(&self, buffer: usize, data: &[u8]) {
        self.state().pushes.push((buffer, data.to_vec()));
    }

    fn pacing_data(&self) -> Option<&PacingData> {
        Some(&self.0.pacing)
    }

    fn recovery_page(&self) -> Option<&DbrRecoveryPage> {
        self.0.recovery.as_ref()
    }

    fn event_channel(&self) -> Option<Receiver<DeviceEvent>> {
        self.0.recovery.as_ref().map(|_| self.0.events.1.clone())
    }

    fn ack_event(&self) {
        self.0.acked_events.fetch_add(1, Ordering::AcqRel);
    }
}

impl ControlPath for EmulatedDevice {
    fn create_cq(&self, req: &CqCreateReq) -> Result<QueueResources, Error> {
        self.control_result()?;
        let mut state = self.state();
        let res = state.assign_id();
        state.cqs.insert(res.id, EmuCq::new(req.ring.clone()));
        Ok(res)
    }

    fn resize_cq(&self, cq_id: u32, ring: &RingInfo) -> Result<(), Error> {
        self.control_result()?;
        let mut state = self.state();
        let suppress_cutoff = state.suppress_cutoff;
        let cq = state.cq(cq_id)?;
        if !suppress_cutoff {
            cq.push(Cqe::Cutoff { status: 0 });
        }
        cq.switch_ring(ring.clone());
        Ok(())
    }

    fn destroy_cq(&self, cq_id: u32) -> Result<(), Error> {
        self.control_result()?;
        self.state()
            .cqs
            .remove(&cq_id)
            .map(|_| ())
            .ok_or_else(|| unknown("CQ", cq_id))
    }

    fn create_qp(&self, req: &QpCreateReq) -> Result<QueueResources, Error> {
        self.control_result()?;
        let mut state = self.state();
        let res = state.assign_id();
        state.qps.insert(
            res.id,
            EmuQp {
                handle: req.handle,
                qp_type: req.qp_type,
                state: QpState::Reset,
                send_cq: req.send_cq,
                recv_cq: req.recv_cq,
                srq: req.srq,
                sq: Fetcher::new(req.sq.clone()),
                sq_wqe_count: req.sq_wqe_count,
                rq: req.rq.clone().map(Fetcher::new),
                #[cfg(test)]
                psn_search: req.psn_search.clone(),
                sends: VecDeque::new(),
                recvs: VecDeque::new(),
                completed: 0,
            },
        );
        Ok(res)
    }

    fn modify_qp(&self, qp_id: u32, state: QpState) -> Result<(), Error> {
        self.control_result()?;
        let mut emu = self.state();
        let qp = emu.qp(qp_id)?;
        if state == QpState::Reset {
            qp.reset();
        }
        qp.state = state;
        Ok(())
    }

    fn destroy_qp(&self, qp_id: u32) -> Result<(), Error> {
        self.control_result()?;
        self.state()
            .qps
            .remove(&qp_id)
            .map(|_| ())
            .ok_or_else(|| unknown("QP", qp_id))
    }

    fn create_srq(&self, req: &SrqCreateReq) -> Result<QueueResources, Error> {
        self.control_result()?;
        let mut state = self.state();
        let res = state.assign_id();
        state.srqs.insert(
            res.id,
            EmuSrq {
                fetcher: Fetcher::new(req.ring.clone()),
                recvs: VecDeque::new(),
            },
        );
        Ok(res)
    }

    fn destroy_srq(&self, srq_id: u32) -> Result<(), Error> {
        self.control_result()?;
        self.state()
            .srqs
            .remove(&srq_id)
            .map(|_| ())
            .ok_or_else(|| unknown("SRQ", srq_id))
    }

    fn poll_kernel_cq(&self, _cq_id: u32) -> Result<usize, Error> {
        self.0.kernel_polls.fetch_add(1, Ordering::AcqRel);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{constants::CQE_SIZE, DmaRegion};
    use crate::device::types::{cqe_is_valid, CQE_TYPE_TOGGLE_OFFSET};

    fn ring(depth: u32, stride: usize) -> RingInfo {
        RingInfo {
            region: Arc::new(DmaRegion::new(depth as usize * stride)),
            depth,
            stride: stride as u32,
            fixed_wqe_slots: None,
        }
    }

    #[test]
    fn test_cqe_toggle_follows_producer_lap() {
        let dev = EmulatedDevice::new();
        let ring = ring(2, CQE_SIZE);
        let region = Arc::clone(&ring.region);
        let res = dev
            .create_cq(&CqCreateReq {
                handle: 0,
                ring,
            })
            .unwrap();
        for _ in 0..3 {
            dev.inject_cqe(res.id, Cqe::Cutoff { status: 0 }).unwrap();
        }
        let toggle = |idx: usize| region.read_u8_volatile(idx * CQE_SIZE + CQE_TYPE_TOGGLE_OFFSET);
        // third entry overwrote slot 0 on the second lap
        assert!(cqe_is_valid(toggle(0), true));
        assert!(cqe_is_valid(toggle(1), false));
    }

    #[test]
    fn test_fifo_register_encodes_room() {
        let dev = EmulatedDevice::new();
        dev.script_fifo_occupancy([100]);
        let fifo = dev.attr().fifo();
        assert_eq!(fifo.occupancy(dev.read_fifo_register()), 100);
        assert_eq!(fifo.occupancy(dev.read_fifo_register()), 0);
    }

    #[test]
    fn test_control_failure_is_one_shot() {
        let dev = EmulatedDevice::new();
        dev.fail_next_control();
        let req = CqCreateReq {
            handle: 0,
            ring: ring(4, CQE_SIZE),
        };
        assert!(dev.create_cq(&req).is_err());
        assert!(dev.create_cq(&req).is_ok());
    }

    #[test]
    fn test_unknown_queue_doorbell_is_recorded() {
        let dev = EmulatedDevice::new();
        let key = DoorbellKey::build(DB_TYPE_SQ, 42, 3, false, 0);
        dev.write_doorbell(EMULATED_DB_PAGE, key.raw());
        assert_eq!(dev.doorbells().len(), 1);
        assert!(dev.posted_sends(42).is_empty());
    }
}
