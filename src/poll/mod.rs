use crate::{
    cq::Cq,
    device::{
        constants::CQE_SIZE,
        ringbuf::RingQueue,
        types::{cqe_is_valid, Cqe, CQE_QP_HANDLE_OFFSET, CQE_TYPE_TOGGLE_OFFSET},
        DeviceAdaptor, DmaRegion,
    },
    types::WorkCompletion,
    Context, ContextInner, Error,
};

mod completion;
mod flush;

use self::completion::CqeAction;

/// What one pass over a completion ring did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingPoll {
    pub(crate) consumed: u32,
    /// A cutoff entry closed the ring.
    pub(crate) cutoff: bool,
}

impl ContextInner<dyn DeviceAdaptor> {
    /// Consume valid entries from `ring` until it is empty, `budget` results
    /// have been produced, or a cutoff entry is seen.
    pub(crate) fn poll_ring(
        &self,
        ring: &mut RingQueue,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) -> RingPoll {
        let mut polled = RingPoll::default();
        loop {
            let offset = ring.head_slot();
            let region = ring.region();
            let type_toggle = region.read_u8_volatile(offset + CQE_TYPE_TOGGLE_OFFSET);
            if !cqe_is_valid(type_toggle, ring.head_epoch()) {
                break;
            }
            DmaRegion::read_barrier();
            let mut raw = [0u8; CQE_SIZE];
            region.read(offset, &mut raw);

            let action = self.handle_cqe(Cqe::parse(&raw), out, budget);
            if action == CqeAction::Retry {
                break;
            }
            region.fill(offset + CQE_QP_HANDLE_OFFSET, 8, 0);
            ring.advance_head(1);
            polled.consumed += 1;
            if action == CqeAction::Cutoff {
                polled.cutoff = true;
                break;
            }
        }
        polled
    }
}

impl Context {
    /// Append up to `max` results to `wcs` and return how many were added.
    ///
    /// Results carried over from a resize come first, then the ring, then
    /// synthetic flush errors for queue pairs on the CQ's flush lists.
    pub fn poll_cq(
        &self,
        cq: &Cq,
        wcs: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, Error> {
        let ctx = self.0.lookup_cq(cq.handle).ok_or(Error::InvalidCq)?;
        let start = wcs.len();
        let mut budget = max;

        let mut inner = ctx.inner.lock();
        while budget > 0 {
            let Some(wc) = inner.side_list.pop_front() else {
                break;
            };
            wcs.push(wc);
            budget -= 1;
        }
        if budget > 0 {
            let polled = self.0.poll_ring(&mut inner.ring, wcs, &mut budget);
            if polled.consumed > 0 {
                self.0.ring_cq_doorbell(&ctx, &inner.ring);
            }
        }
        if budget > 0 {
            self.0.drain_flush_lists(&ctx, wcs, &mut budget);
        }
        Ok(wcs.len() - start)
    }
}
