use crate::{device::ringbuf::RingQueue, types::WcOpcode};

/// Software record tracking one posted WQE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestSlot {
    pub(crate) wr_id: u64,
    pub(crate) next: Option<u32>,
    pub(crate) byte_count: u32,
    pub(crate) signaled: bool,
    /// Ring slots the WQE occupies.
    pub(crate) slots: u32,
    pub(crate) opcode: WcOpcode,
    pub(crate) start_psn: u32,
    pub(crate) next_psn: u32,
    posted: bool,
}

impl RequestSlot {
    fn linked(next: Option<u32>) -> Self {
        Self {
            wr_id: 0,
            next,
            byte_count: 0,
            signaled: false,
            slots: 0,
            opcode: WcOpcode::Send,
            start_psn: 0,
            next_psn: 0,
            posted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeList {
    /// Circular list, slots retire in posting order.
    Ordered,
    /// Terminated list, slots come back in any order.
    Shared,
}

impl FreeList {
    fn link(self, count: u32) -> Box<[RequestSlot]> {
        (0..count)
            .map(|i| match self {
                FreeList::Ordered => RequestSlot::linked(Some((i + 1) % count)),
                FreeList::Shared => RequestSlot::linked((i + 1 < count).then_some(i + 1)),
            })
            .collect()
    }
}

/// A hardware ring paired with the request records of the WQEs posted to it.
pub(crate) struct JointQueue {
    ring: RingQueue,
    slots: Box<[RequestSlot]>,
    /// Next record handed out.
    start: u32,
    /// Oldest outstanding record (ordered) or tail of the free list (shared).
    last: u32,
    outstanding: u32,
    kind: FreeList,
}

impl JointQueue {
    /// Queue whose WQEs complete in posting order. One record is never handed
    /// out, so a consumer index equal to the oldest record always means
    /// nothing retired. `count - 1` can be posted.
    pub(crate) fn ordered(ring: RingQueue, count: u32) -> Self {
        Self {
            ring,
            slots: FreeList::Ordered.link(count),
            start: 0,
            last: 0,
            outstanding: 0,
            kind: FreeList::Ordered,
        }
    }

    /// Queue whose WQEs complete by tag in any order. One record stays
    /// parked at the tail of the free list, so `count - 1` can be posted.
    pub(crate) fn shared(ring: RingQueue, count: u32) -> Self {
        Self {
            ring,
            slots: FreeList::Shared.link(count),
            start: 0,
            last: count - 1,
            outstanding: 0,
            kind: FreeList::Shared,
        }
    }

    /// Forget every outstanding record and empty the ring.
    pub(crate) fn reset(&mut self) {
        let count = self.records();
        self.slots = self.kind.link(count);
        self.start = 0;
        self.last = match self.kind {
            FreeList::Ordered => 0,
            FreeList::Shared => count - 1,
        };
        self.outstanding = 0;
        self.ring.reset();
    }

    pub(crate) fn ring(&self) -> &RingQueue {
        &self.ring
    }

    pub(crate) fn ring_mut(&mut self) -> &mut RingQueue {
        &mut self.ring
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.slots.len() as u32 - 1
    }

    /// Records in the index space, including the parked one.
    pub(crate) fn records(&self) -> u32 {
        self.slots.len() as u32
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub(crate) fn available(&self) -> u32 {
        self.capacity() - self.outstanding
    }

    /// Index of the next record [`acquire_slot`](Self::acquire_slot) returns.
    #[cfg(test)]
    pub(crate) fn start(&self) -> u32 {
        self.start
    }

    #[cfg(test)]
    pub(crate) fn last(&self) -> u32 {
        self.last
    }

    pub(crate) fn slot(&self, idx: u32) -> Option<&RequestSlot> {
        self.slots.get(idx as usize)
    }

    pub(crate) fn slot_mut(&mut self, idx: u32) -> Option<&mut RequestSlot> {
        self.slots.get_mut(idx as usize)
    }

    pub(crate) fn is_posted(&self, idx: u32) -> bool {
        self.slot(idx).is_some_and(|slot| slot.posted)
    }

    /// Pop the head of the free list. The returned index is the tag the
    /// hardware echoes back.
    pub(crate) fn acquire_slot(&mut self) -> Option<(u32, &mut RequestSlot)> {
        let idx = self.start;
        match self.kind {
            FreeList::Ordered => {
                if self.outstanding == self.capacity() {
                    return None;
                }
                self.start = self.slots[idx as usize].next?;
            }
            FreeList::Shared => {
                if self.start == self.last {
                    return None;
                }
                self.start = self.slots[idx as usize].next?;
            }
        }
        self.outstanding += 1;
        let slot = &mut self.slots[idx as usize];
        let next = slot.next;
        *slot = RequestSlot::linked(next);
        slot.posted = true;
        Some((idx, slot))
    }

    /// Oldest unretired record of an ordered queue.
    pub(crate) fn oldest(&self) -> Option<u32> {
        (self.kind == FreeList::Ordered && self.outstanding > 0).then_some(self.last)
    }

    /// Retire the oldest record of an ordered queue and free its ring slots.
    pub(crate) fn retire_oldest(&mut self) -> Option<RequestSlot> {
        let idx = self.oldest()?;
        let slot = &mut self.slots[idx as usize];
        slot.posted = false;
        let retired = *slot;
        self.last = retired.next?;
        self.outstanding -= 1;
        self.ring.advance_head(retired.slots);
        Some(retired)
    }

    /// Return a record of a shared queue to the free list by tag.
    pub(crate) fn release_slot(&mut self, idx: u32) -> Option<RequestSlot> {
        if self.kind != FreeList::Shared || !self.is_posted(idx) {
            return None;
        }
        let retired = {
            let slot = &mut self.slots[idx as usize];
            slot.posted = false;
            slot.next = None;
            *slot
        };
        self.slots[self.last as usize].next = Some(idx);
        self.last = idx;
        self.outstanding -= 1;
        self.ring.advance_head(retired.slots);
        Some(retired)
    }
}
