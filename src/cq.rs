use crate::{
    device::{
        constants::{
            CQE_SIZE, DB_TYPE_CQ, DB_TYPE_CQ_ARMALL, DB_TYPE_CQ_ARMENA, DB_TYPE_CQ_ARMSE,
            DB_TYPE_CQ_CUTOFF_ACK,
        },
        ringbuf::RingQueue,
        types::{cqe_is_valid, CQE_QP_HANDLE_OFFSET, CQE_TYPE_TOGGLE_OFFSET},
        CqCreateReq, DeviceAdaptor, RingInfo,
    },
    doorbell::{Doorbell, QueueKind},
    lock::{self, QueueLock},
    registry::Handle,
    types::{Qpn, WorkCompletion},
    Context, ContextInner, Error,
};
use log::{debug, info};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

/// Completion queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cq {
    pub(crate) handle: Handle,
    id: u32,
}

impl Cq {
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Queue pairs whose outstanding requests are completed in software.
#[derive(Default)]
pub(crate) struct FlushLists {
    pub(crate) sq: VecDeque<Handle>,
    pub(crate) rq: VecDeque<Handle>,
}

pub(crate) struct CqContext {
    pub(crate) id: u32,
    pub(crate) db: Doorbell,
    /// Queue pairs attached to this CQ.
    pub(crate) users: AtomicU32,
    pub(crate) flush: Mutex<FlushLists>,
    pub(crate) inner: QueueLock<CqInner>,
}

pub(crate) struct CqInner {
    pub(crate) ring: RingQueue,
    /// Results drained from a retired ring during resize.
    pub(crate) side_list: VecDeque<WorkCompletion>,
}

fn ring_info(ring: &RingQueue) -> RingInfo {
    RingInfo {
        region: Arc::clone(ring.region()),
        depth: ring.depth(),
        stride: ring.stride(),
        fixed_wqe_slots: None,
    }
}

impl Context {
    pub fn create_cq(&self, depth: u32) -> Result<Cq, Error> {
        if depth == 0 {
            return Err(Error::InvalidDepth(depth));
        }
        let ring = RingQueue::new(depth, CQE_SIZE as u32, 0);
        let handle = lock::write(&self.0.cqs).reserve();

        let res = self.0.adaptor.control().create_cq(&CqCreateReq {
            handle: handle.to_raw(),
            ring: ring_info(&ring),
        });
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                lock::write(&self.0.cqs).cancel(handle);
                return Err(err);
            }
        };

        let ctx = Arc::new(CqContext {
            id: res.id,
            db: Doorbell::new(res.db_page, res.id),
            users: AtomicU32::new(0),
            flush: Mutex::new(FlushLists::default()),
            inner: QueueLock::new(
                CqInner {
                    ring,
                    side_list: VecDeque::new(),
                },
                self.0.config.single_threaded,
            ),
        });
        let key = ctx.db.key(DB_TYPE_CQ_ARMENA, 0, false, 0);
        self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);

        lock::write(&self.0.cqs).fill(handle, ctx);
        if let Some(lists) = &self.0.recovery {
            lists.insert(QueueKind::Cq, handle);
        }
        debug!("created CQ {} with depth {depth}", res.id);

        Ok(Cq { handle, id: res.id })
    }

    pub fn destroy_cq(&self, cq: Cq) -> Result<(), Error> {
        let ctx = self.0.lookup_cq(cq.handle).ok_or(Error::InvalidCq)?;
        if ctx.users.load(Ordering::Acquire) != 0 {
            return Err(Error::CqInUse);
        }
        self.0.adaptor.control().destroy_cq(ctx.id)?;
        if let Some(lists) = &self.0.recovery {
            lists.remove(QueueKind::Cq, cq.handle);
        }
        lock::write(&self.0.cqs).remove(cq.handle);
        Ok(())
    }

    /// Request an event for the next completion, or the next solicited one.
    pub fn arm_cq(&self, cq: &Cq, solicited_only: bool) -> Result<(), Error> {
        let ctx = self.0.lookup_cq(cq.handle).ok_or(Error::InvalidCq)?;
        let db_type = if solicited_only {
            DB_TYPE_CQ_ARMSE
        } else {
            DB_TYPE_CQ_ARMALL
        };
        let inner = ctx.inner.lock();
        let key = ctx
            .db
            .key(db_type, inner.ring.head(), inner.ring.head_epoch(), 0);
        self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);
        Ok(())
    }

    /// Move the CQ onto a ring of `depth` entries.
    ///
    /// Entries still on the old ring are drained into a side list that later
    /// polls return first. The old ring is only released once the device
    /// marks the switch with a cutoff entry.
    pub fn resize_cq(&self, cq: &Cq, depth: u32) -> Result<(), Error> {
        if depth == 0 {
            return Err(Error::InvalidDepth(depth));
        }
        let ctx = self.0.lookup_cq(cq.handle).ok_or(Error::InvalidCq)?;
        let mut guard = ctx.inner.lock();
        let inner = &mut *guard;

        let new_ring = RingQueue::new(depth, CQE_SIZE as u32, 0);
        self.0
            .adaptor
            .control()
            .resize_cq(ctx.id, &ring_info(&new_ring))?;

        let mut drained = Vec::new();
        let mut attempts = 0;
        loop {
            let mut budget = usize::MAX;
            let polled = self.0.poll_ring(&mut inner.ring, &mut drained, &mut budget);
            if polled.cutoff {
                break;
            }
            attempts += 1;
            if attempts > self.0.config.resize_retry_count {
                inner.side_list.extend(drained);
                return Err(Error::ResizeTimeout);
            }
            thread::sleep(Duration::from_micros(self.0.config.resize_wait_us));
        }
        inner.side_list.extend(drained);
        inner.ring = new_ring;

        let key = ctx.db.key(DB_TYPE_CQ_CUTOFF_ACK, 0, false, 0);
        self.0.doorbells.ring(&self.0.adaptor, &ctx.db, key);
        info!(
            "CQ {} resized to {depth}, {} results carried over",
            ctx.id,
            inner.side_list.len()
        );
        Ok(())
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    /// Tell the device how far the consumer got.
    pub(crate) fn ring_cq_doorbell(&self, cq: &CqContext, ring: &RingQueue) {
        let key = cq.db.key(DB_TYPE_CQ, ring.head(), ring.head_epoch(), 0);
        self.doorbells.ring(&self.adaptor, &cq.db, key);
    }

    /// Zero the QP handle of every unpolled entry that belongs to `qp_handle`
    /// and drop its carried over results, so the poller skips them.
    pub(crate) fn scrub_cq(&self, cq: &CqContext, qp_handle: u64, qpn: Qpn) {
        let mut inner = cq.inner.lock();
        let ring = &inner.ring;
        let region = ring.region();
        let mut index = ring.head();
        let mut epoch = ring.head_epoch();
        let mut scrubbed = 0;
        for _ in 0..ring.depth() {
            let offset = index as usize * CQE_SIZE;
            if !cqe_is_valid(
                region.read_u8_volatile(offset + CQE_TYPE_TOGGLE_OFFSET),
                epoch,
            ) {
                break;
            }
            let mut raw = [0u8; 8];
            region.read(offset + CQE_QP_HANDLE_OFFSET, &mut raw);
            if u64::from_le_bytes(raw) == qp_handle {
                region.fill(offset + CQE_QP_HANDLE_OFFSET, raw.len(), 0);
                scrubbed += 1;
            }
            index += 1;
            if index == ring.depth() {
                index = 0;
                epoch = !epoch;
            }
        }
        inner.side_list.retain(|wc| wc.qpn != qpn);
        if scrubbed > 0 {
            debug!("scrubbed {scrubbed} entries of QP {} from CQ {}", qpn.get(), cq.id);
        }
    }
}
