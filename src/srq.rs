use crate::{
    device::{
        constants::{
            DB_TYPE_SRQ, DB_TYPE_SRQ_ARM, DB_TYPE_SRQ_ARMENA, SLOT_SIZE, WQE_HDR_SLOTS,
        },
        ringbuf::RingQueue,
        DeviceAdaptor, RingInfo, SrqCreateReq,
    },
    doorbell::{Doorbell, QueueKind},
    lock::{self, QueueLock},
    qp::ring_depth,
    queue::JointQueue,
    registry::Handle,
    types::{PostError, RecvWr, WcOpcode},
    wqe::{build_recv, recv_wqe_slots},
    Context, ContextInner, Error,
};
use log::debug;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// Shared receive queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Srq {
    pub(crate) handle: Handle,
    id: u32,
}

impl Srq {
    pub fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SrqInitAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    /// Free entry count at or below which the limit event is armed. 0 keeps
    /// the event disabled.
    pub limit: u32,
}

impl Default for SrqInitAttr {
    fn default() -> Self {
        Self {
            max_wr: 64,
            max_sge: 1,
            limit: 0,
        }
    }
}

pub(crate) struct SrqContext {
    pub(crate) id: u32,
    pub(crate) db: Doorbell,
    /// Queue pairs receiving through this SRQ.
    pub(crate) users: AtomicU32,
    pub(crate) inner: QueueLock<SrqInner>,
}

pub(crate) struct SrqInner {
    pub(crate) queue: JointQueue,
    wqe_slots: u32,
    max_sge: u32,
    threshold: u32,
    /// Arm deferred until enough entries are consumed.
    arm_req: bool,
}

impl SrqContext {
    /// Give back the record the device echoed as `tag`. Returns the wr_id it
    /// carried, or `None` for a tag that is not outstanding.
    pub(crate) fn release_slot(&self, tag: u32) -> Option<u64> {
        let mut inner = self.inner.lock();
        inner.queue.release_slot(tag).map(|slot| slot.wr_id)
    }
}

impl Context {
    pub fn create_srq(&self, attr: &SrqInitAttr) -> Result<Srq, Error> {
        let dev_attr = self.0.adaptor.attr();
        if attr.max_wr == 0 || attr.max_wr > dev_attr.max_srq_wr {
            return Err(Error::InvalidDepth(attr.max_wr));
        }
        let max_sge = dev_attr.max_sge;
        if attr.max_sge > max_sge {
            return Err(Error::TooManySge {
                count: attr.max_sge as usize,
                max: max_sge,
            });
        }
        let wqe_slots = WQE_HDR_SLOTS + attr.max_sge.max(1);
        let ring = RingQueue::new(ring_depth(attr.max_wr, wqe_slots, 0)?, SLOT_SIZE as u32, 0);
        let records = attr.max_wr + 1;

        let handle = lock::write(&self.0.srqs).reserve();
        let res = self.0.adaptor.control().create_srq(&SrqCreateReq {
            handle: handle.to_raw(),
            ring: RingInfo {
                region: Arc::clone(ring.region()),
                depth: ring.depth(),
                stride: ring.stride(),
                fixed_wqe_slots: Some(wqe_slots),
            },
            wqe_count: records,
        });
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                lock::write(&self.0.srqs).cancel(handle);
                return Err(err);
            }
        };

        let ctx = Arc::new(SrqContext {
            id: res.id,
            db: Doorbell::new(res.db_page, res.id),
            users: AtomicU32::new(0),
            inner: QueueLock::new(
                SrqInner {
                    queue: JointQueue::shared(ring, records),
                    wqe_slots,
                    max_sge: attr.max_sge,
                    threshold: attr.limit,
                    arm_req: false,
                },
                self.0.config.single_threaded,
            ),
        });
        if attr.limit > 0 {
            let key = ctx.db.key(DB_TYPE_SRQ_ARMENA, 0, false, 0);
            self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);
        }

        lock::write(&self.0.srqs).fill(handle, ctx);
        if let Some(lists) = &self.0.recovery {
            lists.insert(QueueKind::Srq, handle);
        }
        debug!("created SRQ {} with {} entries", res.id, attr.max_wr);
        Ok(Srq { handle, id: res.id })
    }

    pub fn destroy_srq(&self, srq: Srq) -> Result<(), Error> {
        let ctx = self.0.lookup_srq(srq.handle).ok_or(Error::InvalidSrq)?;
        if ctx.users.load(Ordering::Acquire) != 0 {
            return Err(Error::SrqInUse);
        }
        self.0.adaptor.control().destroy_srq(ctx.id)?;
        if let Some(lists) = &self.0.recovery {
            lists.remove(QueueKind::Srq, srq.handle);
        }
        lock::write(&self.0.srqs).remove(srq.handle);
        Ok(())
    }

    /// Set the limit and arm the limit event, now if the queue is already
    /// at or below it, otherwise on the post that brings it there.
    pub fn arm_srq(&self, srq: &Srq, limit: u32) -> Result<(), Error> {
        let ctx = self.0.lookup_srq(srq.handle).ok_or(Error::InvalidSrq)?;
        let mut inner = ctx.inner.lock();
        inner.threshold = limit;
        if inner.queue.available() <= limit {
            inner.arm_req = false;
            let key = ctx.db.key(DB_TYPE_SRQ_ARM, limit, false, 0);
            self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);
        } else {
            inner.arm_req = true;
        }
        Ok(())
    }

    pub fn post_srq_recv(&self, srq: &Srq, wrs: &[RecvWr]) -> Result<(), PostError> {
        let ctx = self
            .0
            .lookup_srq(srq.handle)
            .ok_or(PostError {
                index: 0,
                source: Error::InvalidSrq,
            })?;
        let mut guard = ctx.inner.lock();
        let inner = &mut *guard;

        let mut written = 0;
        let mut result = Ok(());
        for (index, wr) in wrs.iter().enumerate() {
            if let Err(source) = recv_wqe_slots(wr, inner.max_sge) {
                result = Err(PostError { index, source });
                break;
            }
            if inner.queue.ring().is_full(inner.wqe_slots) {
                debug!("SRQ {} full at request {index}", ctx.id);
                result = Err(PostError {
                    index,
                    source: Error::QueueFull,
                });
                break;
            }
            let Some((tag, slot)) = inner.queue.acquire_slot() else {
                result = Err(PostError {
                    index,
                    source: Error::QueueFull,
                });
                break;
            };
            slot.wr_id = wr.wr_id;
            slot.slots = inner.wqe_slots;
            slot.opcode = WcOpcode::Recv;
            slot.signaled = true;

            build_recv(wr, tag, inner.wqe_slots).copy_to_ring(inner.queue.ring());
            inner.queue.ring_mut().advance_tail(inner.wqe_slots);
            written += 1;
        }

        if written > 0 {
            let ring = inner.queue.ring();
            let key = ctx.db.key(DB_TYPE_SRQ, ring.tail(), ring.tail_epoch(), 0);
            self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);
            self.0.check_srq_arm(&ctx, inner);
        }
        result
    }

    /// Entries that can still be posted.
    pub fn srq_available(&self, srq: &Srq) -> Result<u32, Error> {
        let ctx = self.0.lookup_srq(srq.handle).ok_or(Error::InvalidSrq)?;
        let available = ctx.inner.lock().queue.available();
        Ok(available)
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    fn check_srq_arm(&self, srq: &SrqContext, inner: &mut SrqInner) {
        if inner.arm_req && inner.queue.available() <= inner.threshold {
            inner.arm_req = false;
            let key = srq.db.key(DB_TYPE_SRQ_ARM, inner.threshold, false, 0);
            self.doorbells.ring(&self.adaptor, &srq.db, key);
        }
    }
}
