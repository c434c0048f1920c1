use crate::{
    config::WqeMode,
    cq::CqContext,
    device::{
        constants::{
            DB_TYPE_PUSH_END, DB_TYPE_PUSH_START, DB_TYPE_RQ, DB_TYPE_SQ, MAX_SGE_VARIABLE,
            SLOT_SIZE, STATIC_MAX_INLINE, STATIC_WQE_SLOTS, VARIABLE_MAX_INLINE, WQE_HDR_SLOTS,
        },
        ringbuf::{AuxBuffer, RingQueue},
        types::PsnSearchFormat,
        ChipGen, DeviceAdaptor, DeviceAttr, QpCreateReq, RingInfo,
    },
    doorbell::{Doorbell, QueueKind},
    lock::{self, QueueLock},
    queue::JointQueue,
    registry::Handle,
    srq::{Srq, SrqContext},
    types::{Pmtu, PostError, Psn, QpState, QpType, Qpn, RecvWr, SendWr, WcOpcode},
    utils::calculate_packet_cnt,
    wqe::{build_recv, build_send, recv_wqe_slots, SendLimits, SendWqe},
    Context, ContextInner, Cq, Error,
};
use log::{debug, info};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Queue pair handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Qp {
    pub(crate) handle: Handle,
    qpn: Qpn,
}

impl Qp {
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }
}

#[derive(Debug, Clone)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub srq: Option<Srq>,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline: u32,
    /// Every send is signaled regardless of its flags.
    pub sq_sig_all: bool,
    pub pmtu: Pmtu,
    pub qkey: u32,
    pub initial_psn: Psn,
}

impl QpInitAttr {
    pub fn new(qp_type: QpType, send_cq: Cq, recv_cq: Cq) -> Self {
        Self {
            qp_type,
            send_cq,
            recv_cq,
            srq: None,
            max_send_wr: 64,
            max_recv_wr: 64,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline: 0,
            sq_sig_all: false,
            pmtu: Pmtu::default(),
            qkey: 0,
            initial_psn: Psn::default(),
        }
    }
}

pub(crate) struct QpContext {
    pub(crate) handle: Handle,
    pub(crate) qpn: Qpn,
    pub(crate) send_cq: Arc<CqContext>,
    pub(crate) recv_cq: Arc<CqContext>,
    pub(crate) srq: Option<Arc<SrqContext>>,
    pub(crate) sq_db: Doorbell,
    pub(crate) rq_db: Doorbell,
    /// Set while the QP sits on its send CQ's flush list. Changed only under
    /// that CQ's flush lock.
    pub(crate) sq_flushed: AtomicBool,
    /// Same for the receive CQ.
    pub(crate) rq_flushed: AtomicBool,
    push_buffer: Option<usize>,
    pub(crate) inner: QueueLock<QpInner>,
}

pub(crate) struct QpInner {
    pub(crate) state: QpState,
    pub(crate) sq: JointQueue,
    pub(crate) rq: Option<JointQueue>,
    limits: SendLimits,
    rq_wqe_slots: u32,
    max_recv_sge: u32,
    psn_format: Option<PsnSearchFormat>,
    pmtu: Pmtu,
    initial_psn: Psn,
    psn: Psn,
    /// Rolling index into the MSN table.
    msn: u32,
}

impl QpInner {
    /// PSN range the request occupies, advancing the send PSN.
    fn take_psn(&mut self, wqe: &SendWqe) -> (u32, u32) {
        let start = self.psn.get();
        let packets = match self.limits.qp_type {
            QpType::Rc if wqe.consumes_psn() => calculate_packet_cnt(self.pmtu, wqe.data_len),
            QpType::Rc => 0,
            QpType::Ud => 1,
        };
        self.psn.wrapping_add(packets);
        (start, self.psn.get())
    }

    fn record_psn(&mut self, swq_idx: u32, wqe: &SendWqe, start_psn: u32, next_psn: u32) {
        let Some(format) = self.psn_format else {
            return;
        };
        let start_slot = self.sq.ring().tail() as u16;
        let entry = match format {
            PsnSearchFormat::Msn => {
                let entry = self.msn;
                self.msn = self.msn.wrapping_add(1);
                entry
            }
            PsnSearchFormat::Legacy | PsnSearchFormat::Extended => swq_idx,
        };
        let Some(aux) = self.sq.ring().aux() else {
            return;
        };
        let mut buf = [0u8; 16];
        let dst = &mut buf[..format.entry_size()];
        format.write(dst, wqe.wqe_type, start_psn, next_psn, start_slot);
        aux.write(entry, dst);
    }

    /// Back to the freshly created layout. Ring memory stays registered.
    fn reset(&mut self) {
        self.sq.reset();
        if let Some(rq) = self.rq.as_mut() {
            rq.reset();
        }
        self.psn = self.initial_psn;
        self.msn = 0;
    }
}

fn psn_search_format(attr: &DeviceAttr) -> PsnSearchFormat {
    if attr.hw_retx {
        PsnSearchFormat::Msn
    } else if attr.chip_gen == ChipGen::Legacy {
        PsnSearchFormat::Legacy
    } else {
        PsnSearchFormat::Extended
    }
}

/// Slots for `wr` requests of `wqe_slots` each plus the firmware gap.
pub(crate) fn ring_depth(wr: u32, wqe_slots: u32, delta: u32) -> Result<u32, Error> {
    wr.checked_mul(wqe_slots)
        .and_then(|slots| slots.checked_add(delta))
        .ok_or(Error::InvalidDepth(wr))
}

fn post_err(index: usize) -> impl FnOnce(Error) -> PostError {
    move |source| PostError { index, source }
}

impl Context {
    pub fn create_qp(&self, attr: &QpInitAttr) -> Result<Qp, Error> {
        let dev_attr = self.0.adaptor.attr();
        if attr.max_send_wr == 0 || attr.max_send_wr > dev_attr.max_qp_wr {
            return Err(Error::InvalidDepth(attr.max_send_wr));
        }
        if attr.srq.is_none()
            && (attr.max_recv_wr == 0 || attr.max_recv_wr > dev_attr.max_qp_wr)
        {
            return Err(Error::InvalidDepth(attr.max_recv_wr));
        }
        let wqe_mode = self.0.config.wqe_mode;

        let (sge_limit, inline_limit) = match wqe_mode {
            WqeMode::Static => (STATIC_WQE_SLOTS - WQE_HDR_SLOTS, STATIC_MAX_INLINE),
            WqeMode::Variable => (MAX_SGE_VARIABLE, VARIABLE_MAX_INLINE),
        };
        let sge_limit = sge_limit.min(dev_attr.max_sge);
        for count in [attr.max_send_sge, attr.max_recv_sge] {
            if count > sge_limit {
                return Err(Error::TooManySge {
                    count: count as usize,
                    max: sge_limit,
                });
            }
        }
        let max_inline = attr
            .max_inline
            .min(self.0.config.max_inline)
            .min(inline_limit);

        let send_cq = self
            .0
            .lookup_cq(attr.send_cq.handle)
            .ok_or(Error::InvalidCq)?;
        let recv_cq = self
            .0
            .lookup_cq(attr.recv_cq.handle)
            .ok_or(Error::InvalidCq)?;
        let srq = match attr.srq {
            Some(srq) => Some(self.0.lookup_srq(srq.handle).ok_or(Error::InvalidSrq)?),
            None => None,
        };

        // send queue
        let sq_wqe_slots = match wqe_mode {
            WqeMode::Static => STATIC_WQE_SLOTS,
            WqeMode::Variable => {
                let inline_slots = max_inline.div_ceil(SLOT_SIZE as u32);
                WQE_HDR_SLOTS + attr.max_send_sge.max(inline_slots).max(1)
            }
        };
        let fixed_slots = (wqe_mode == WqeMode::Static).then_some(sq_wqe_slots);
        let sq_depth = ring_depth(attr.max_send_wr, sq_wqe_slots, dev_attr.q_full_delta)?;
        let sq_records = attr.max_send_wr + 1;
        let mut sq_ring = RingQueue::new(sq_depth, SLOT_SIZE as u32, dev_attr.q_full_delta);
        let psn_format = (attr.qp_type == QpType::Rc).then(|| psn_search_format(dev_attr));
        if let Some(format) = psn_format {
            sq_ring = sq_ring.with_aux(AuxBuffer::new(sq_records, format.entry_size()));
        }

        // receive queue
        let rq_wqe_slots = WQE_HDR_SLOTS + attr.max_recv_sge.max(1);
        // ignored with an SRQ, where the depth is unchecked
        let rq_records = attr.max_recv_wr.saturating_add(1);
        let rq_ring = match srq {
            Some(_) => None,
            None => {
                let depth = ring_depth(attr.max_recv_wr, rq_wqe_slots, 0)?;
                Some(RingQueue::new(depth, SLOT_SIZE as u32, 0))
            }
        };

        let handle = lock::write(&self.0.qps).reserve();
        let push_buffer = self.0.push_buffers.checkout();
        let req = QpCreateReq {
            handle: handle.to_raw(),
            qp_type: attr.qp_type,
            sq: RingInfo {
                region: Arc::clone(sq_ring.region()),
                depth: sq_ring.depth(),
                stride: sq_ring.stride(),
                fixed_wqe_slots: fixed_slots,
            },
            sq_wqe_count: sq_records,
            psn_search: sq_ring.aux().map(|aux| Arc::clone(aux.region())),
            rq: rq_ring.as_ref().map(|ring| RingInfo {
                region: Arc::clone(ring.region()),
                depth: ring.depth(),
                stride: ring.stride(),
                fixed_wqe_slots: Some(rq_wqe_slots),
            }),
            rq_wqe_count: rq_records,
            send_cq: send_cq.id,
            recv_cq: recv_cq.id,
            srq: srq.as_ref().map(|srq| srq.id),
        };
        let res = match self.0.adaptor.control().create_qp(&req) {
            Ok(res) => res,
            Err(err) => {
                lock::write(&self.0.qps).cancel(handle);
                if let Some(idx) = push_buffer {
                    self.0.push_buffers.give_back(idx);
                }
                return Err(err);
            }
        };

        let qpn = Qpn::new(res.id);
        let inner = QpInner {
            state: QpState::Reset,
            sq: JointQueue::ordered(sq_ring, sq_records),
            rq: rq_ring.map(|ring| JointQueue::ordered(ring, rq_records)),
            limits: SendLimits {
                qp_type: attr.qp_type,
                max_sge: attr.max_send_sge,
                max_inline,
                atomics: dev_attr.atomics,
                qkey: attr.qkey,
                sig_all: attr.sq_sig_all,
                fixed_slots,
            },
            rq_wqe_slots,
            max_recv_sge: attr.max_recv_sge,
            psn_format,
            pmtu: attr.pmtu,
            initial_psn: attr.initial_psn,
            psn: attr.initial_psn,
            msn: 0,
        };

        send_cq.users.fetch_add(1, Ordering::AcqRel);
        recv_cq.users.fetch_add(1, Ordering::AcqRel);
        if let Some(srq) = &srq {
            srq.users.fetch_add(1, Ordering::AcqRel);
        }

        let ctx = Arc::new(QpContext {
            handle,
            qpn,
            send_cq,
            recv_cq,
            srq,
            sq_db: Doorbell::new(res.db_page, res.id),
            rq_db: Doorbell::new(res.db_page, res.id),
            sq_flushed: AtomicBool::new(false),
            rq_flushed: AtomicBool::new(false),
            push_buffer,
            inner: QueueLock::new(inner, self.0.config.single_threaded),
        });
        lock::write(&self.0.qps).fill(handle, ctx);
        if let Some(lists) = &self.0.recovery {
            lists.insert(QueueKind::Qp, handle);
        }
        debug!("created {:?} QP {}", attr.qp_type, qpn.get());

        Ok(Qp { handle, qpn })
    }

    pub fn destroy_qp(&self, qp: Qp) -> Result<(), Error> {
        let ctx = self.0.lookup_qp(qp.handle).ok_or(Error::InvalidQp)?;
        self.0.adaptor.control().destroy_qp(qp.qpn.get())?;

        if let Some(lists) = &self.0.recovery {
            lists.remove(QueueKind::Qp, qp.handle);
        }
        self.0.detach_from_cqs(&ctx);
        lock::write(&self.0.qps).remove(qp.handle);

        ctx.send_cq.users.fetch_sub(1, Ordering::AcqRel);
        ctx.recv_cq.users.fetch_sub(1, Ordering::AcqRel);
        if let Some(srq) = &ctx.srq {
            srq.users.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(idx) = ctx.push_buffer {
            self.0.push_buffers.give_back(idx);
        }
        debug!("destroyed QP {}", qp.qpn.get());
        Ok(())
    }

    /// Transition the QP. Moving to `Error` flushes every outstanding request,
    /// moving to `Reset` discards them.
    pub fn modify_qp(&self, qp: &Qp, state: QpState) -> Result<(), Error> {
        let ctx = self.0.lookup_qp(qp.handle).ok_or(Error::InvalidQp)?;
        self.0.adaptor.control().modify_qp(qp.qpn.get(), state)?;

        match state {
            QpState::Reset => {
                self.0.detach_from_cqs(&ctx);
                let mut inner = ctx.inner.lock();
                inner.reset();
                inner.state = QpState::Reset;
            }
            QpState::Error => {
                ctx.inner.lock().state = QpState::Error;
                self.0.add_flush_qp(&ctx);
            }
            _ => ctx.inner.lock().state = state,
        }
        info!("QP {} moved to {state:?}", qp.qpn.get());
        Ok(())
    }

    pub fn query_qp_state(&self, qp: &Qp) -> Result<QpState, Error> {
        let ctx = self.0.lookup_qp(qp.handle).ok_or(Error::InvalidQp)?;
        let state = ctx.inner.lock().state;
        Ok(state)
    }

    /// Post a batch of send requests and ring the doorbell once.
    ///
    /// Posting stops at the first request that cannot be accepted. Requests
    /// before it stay posted and the error names its index.
    pub fn post_send(&self, qp: &Qp, wrs: &[SendWr]) -> Result<(), PostError> {
        let ctx = self.0.lookup_qp(qp.handle).ok_or_else(|| post_err(0)(Error::InvalidQp))?;
        let dev = &self.0.adaptor;
        let early_stepping = dev.attr().early_stepping;
        let mut inner = ctx.inner.lock();
        if !matches!(inner.state, QpState::Rts | QpState::Error) {
            return Err(post_err(0)(Error::InvalidQpState(inner.state)));
        }

        let mut written = 0;
        let mut result = Ok(());
        for (index, wr) in wrs.iter().enumerate() {
            let wqe = match build_send(wr, &inner.limits) {
                Ok(wqe) => wqe,
                Err(err) => {
                    result = Err(post_err(index)(err));
                    break;
                }
            };
            if inner.sq.ring().is_full(wqe.ring_slots) {
                debug!("QP {} send queue full at request {index}", ctx.qpn.get());
                result = Err(post_err(index)(Error::QueueFull));
                break;
            }
            let Some((swq_idx, slot)) = inner.sq.acquire_slot() else {
                result = Err(post_err(index)(Error::QueueFull));
                break;
            };
            slot.wr_id = wr.wr_id;
            slot.signaled = wqe.signaled;
            slot.slots = wqe.ring_slots;
            slot.opcode = WcOpcode::from(&wr.op);
            slot.byte_count = wqe.completion_len();
            let (start_psn, next_psn) = inner.take_psn(&wqe);
            if let Some(slot) = inner.sq.slot_mut(swq_idx) {
                slot.start_psn = start_psn;
                slot.next_psn = next_psn;
            }

            // an errored QP only records the request so it flushes
            let live = inner.state != QpState::Error;
            if live {
                wqe.buf.copy_to_ring(inner.sq.ring());
                inner.record_psn(swq_idx, &wqe, start_psn, next_psn);
            }
            let ring = inner.sq.ring_mut();
            let push_start = (ring.tail(), ring.tail_epoch());
            ring.advance_tail(wqe.ring_slots);

            if !live {
                continue;
            }
            match ctx.push_buffer {
                Some(buffer) => {
                    let ring = inner.sq.ring();
                    let start = ctx
                        .sq_db
                        .key(DB_TYPE_PUSH_START, push_start.0, push_start.1, 0);
                    self.0.doorbells.ring(dev, &ctx.sq_db, start);
                    dev.write_push_buffer(buffer, wqe.buf.bytes());
                    let end = ctx
                        .sq_db
                        .key(DB_TYPE_PUSH_END, ring.tail(), ring.tail_epoch(), 0);
                    self.0.doorbells.ring(dev, &ctx.sq_db, end);
                    if early_stepping {
                        let key = ctx.sq_db.key(DB_TYPE_SQ, ring.tail(), ring.tail_epoch(), 0);
                        self.0.doorbells.ring(dev, &ctx.sq_db, key);
                    }
                }
                None => written += 1,
            }
        }

        if written > 0 {
            let ring = inner.sq.ring();
            let key = ctx.sq_db.key(DB_TYPE_SQ, ring.tail(), ring.tail_epoch(), 0);
            self.0.doorbells.ring(dev, &ctx.sq_db, key);
        }
        result
    }

    /// Post a batch of receive requests and ring the doorbell once.
    pub fn post_recv(&self, qp: &Qp, wrs: &[RecvWr]) -> Result<(), PostError> {
        let ctx = self.0.lookup_qp(qp.handle).ok_or_else(|| post_err(0)(Error::InvalidQp))?;
        if ctx.srq.is_some() {
            return Err(post_err(0)(Error::QpUsesSrq));
        }
        let mut guard = ctx.inner.lock();
        let inner = &mut *guard;
        if inner.state == QpState::Reset {
            return Err(post_err(0)(Error::InvalidQpState(inner.state)));
        }
        let live = inner.state != QpState::Error;
        let Some(rq) = inner.rq.as_mut() else {
            return Err(post_err(0)(Error::QpUsesSrq));
        };

        let mut written = 0;
        let mut result = Ok(());
        for (index, wr) in wrs.iter().enumerate() {
            if let Err(err) = recv_wqe_slots(wr, inner.max_recv_sge) {
                result = Err(post_err(index)(err));
                break;
            }
            if rq.ring().is_full(inner.rq_wqe_slots) {
                debug!("QP {} receive queue full at request {index}", ctx.qpn.get());
                result = Err(post_err(index)(Error::QueueFull));
                break;
            }
            let Some((wr_idx, slot)) = rq.acquire_slot() else {
                result = Err(post_err(index)(Error::QueueFull));
                break;
            };
            slot.wr_id = wr.wr_id;
            slot.slots = inner.rq_wqe_slots;
            slot.opcode = WcOpcode::Recv;
            slot.signaled = true;

            if live {
                build_recv(wr, wr_idx, inner.rq_wqe_slots).copy_to_ring(rq.ring());
                written += 1;
            }
            rq.ring_mut().advance_tail(inner.rq_wqe_slots);
        }

        if written > 0 {
            let ring = rq.ring();
            let key = ctx.rq_db.key(DB_TYPE_RQ, ring.tail(), ring.tail_epoch(), 0);
            self.0.doorbells.ring(&self.0.adaptor, &ctx.rq_db, key);
        }
        result
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    /// Drop every trace of the QP from its completion queues.
    fn detach_from_cqs(&self, qp: &QpContext) {
        self.remove_flush_qp(qp);
        let raw = qp.handle.to_raw();
        self.scrub_cq(&qp.send_cq, raw, qp.qpn);
        if !Arc::ptr_eq(&qp.send_cq, &qp.recv_cq) {
            self.scrub_cq(&qp.recv_cq, raw, qp.qpn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::EmulatedDevice,
        types::{Key, SendOp, Sge},
        Config,
    };

    fn rts_qp(ctx: &Context, attr: &QpInitAttr) -> Qp {
        let qp = ctx.create_qp(attr).unwrap();
        for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
            ctx.modify_qp(&qp, state).unwrap();
        }
        qp
    }

    #[test]
    fn test_psn_search_tracks_each_send() {
        let dev = EmulatedDevice::new();
        let ctx = Context::new(dev.clone(), Config::default()).unwrap();
        let cq = ctx.create_cq(16).unwrap();
        let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
        attr.initial_psn = Psn::new(100);
        let qp = rts_qp(&ctx, &attr);

        let sge = Sge {
            addr: 0,
            len: 3000,
            key: Key::new(1),
        };
        ctx.post_send(
            &qp,
            &[
                SendWr::new(1, SendOp::Send, vec![sge]),
                SendWr::new(2, SendOp::LocalInv(Key::new(5)), Vec::new()),
            ],
        )
        .unwrap();

        let format = psn_search_format(ctx.attr());
        assert_eq!(format, PsnSearchFormat::Extended);
        let region = dev.psn_search(qp.qpn().get()).unwrap();
        let mut entry = [0u8; 16];
        region.read(0, &mut entry);
        // 3000 bytes at a 1024 byte MTU
        assert_eq!(format.parse(&entry), (100, 103));
        region.read(16, &mut entry);
        assert_eq!(format.parse(&entry), (103, 103));
    }

    #[test]
    fn test_reset_rewinds_psn() {
        let dev = EmulatedDevice::new();
        let ctx = Context::new(dev.clone(), Config::default()).unwrap();
        let cq = ctx.create_cq(16).unwrap();
        let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
        attr.initial_psn = Psn::new(7);
        let qp = rts_qp(&ctx, &attr);
        let send = SendWr::new(1, SendOp::Send, Vec::new());

        ctx.post_send(&qp, &[send.clone()]).unwrap();
        ctx.modify_qp(&qp, QpState::Reset).unwrap();
        for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
            ctx.modify_qp(&qp, state).unwrap();
        }
        ctx.post_send(&qp, &[send]).unwrap();

        let region = dev.psn_search(qp.qpn().get()).unwrap();
        let mut entry = [0u8; 16];
        region.read(0, &mut entry);
        assert_eq!(PsnSearchFormat::Extended.parse(&entry), (7, 8));
    }

    #[test]
    fn test_search_format_by_device() {
        let mut attr = DeviceAttr::default();
        assert_eq!(psn_search_format(&attr), PsnSearchFormat::Extended);
        attr.chip_gen = ChipGen::Legacy;
        assert_eq!(psn_search_format(&attr), PsnSearchFormat::Legacy);
        attr.hw_retx = true;
        assert_eq!(psn_search_format(&attr), PsnSearchFormat::Msn);
    }

    #[test]
    fn test_ud_qp_has_no_search_area() {
        let dev = EmulatedDevice::new();
        let ctx = Context::new(dev.clone(), Config::default()).unwrap();
        let cq = ctx.create_cq(16).unwrap();
        let qp = ctx.create_qp(&QpInitAttr::new(QpType::Ud, cq, cq)).unwrap();
        assert!(dev.psn_search(qp.qpn().get()).is_none());
    }

    #[test]
    fn test_sge_limit_by_mode() {
        let dev = EmulatedDevice::with_attr(DeviceAttr {
            max_sge: 30,
            ..DeviceAttr::default()
        });
        let ctx = Context::new(dev, Config::default()).unwrap();
        let cq = ctx.create_cq(16).unwrap();
        let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
        attr.max_send_sge = 7;
        assert!(matches!(
            ctx.create_qp(&attr),
            Err(Error::TooManySge { count: 7, max: 6 })
        ));
    }
}
