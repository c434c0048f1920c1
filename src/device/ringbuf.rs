use super::dma::DmaRegion;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Wraparound epochs of the two cursors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EpochFlags: u8 {
        const HEAD = 0x1;
        const TAIL = 0x2;
    }
}

/// Optional per WQE side buffer holding sequence number bookkeeping.
pub(crate) struct AuxBuffer {
    region: Arc<DmaRegion>,
    entry_size: usize,
    entries: u32,
}

impl AuxBuffer {
    pub(crate) fn new(entries: u32, entry_size: usize) -> Self {
        Self {
            region: Arc::new(DmaRegion::new(entries as usize * entry_size)),
            entry_size,
            entries,
        }
    }

    pub(crate) fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> u32 {
        self.entries
    }

    pub(crate) fn write(&self, entry: u32, data: &[u8]) {
        let entry = (entry % self.entries) as usize;
        self.region
            .write(entry * self.entry_size, &data[..self.entry_size]);
    }

    #[cfg(test)]
    pub(crate) fn read(&self, entry: u32, data: &mut [u8]) {
        let entry = (entry % self.entries) as usize;
        self.region
            .read(entry * self.entry_size, &mut data[..self.entry_size]);
    }
}

/// Fixed depth circular buffer of fixed size slots.
///
/// `tail` is the producer cursor and `head` the consumer cursor. Each has an
/// epoch bit that flips once per wraparound, so `head == tail` is empty when
/// the epochs match and full when they differ. No internal locking: callers
/// hold the owning queue's lock.
pub(crate) struct RingQueue {
    region: Arc<DmaRegion>,
    depth: u32,
    stride: u32,
    head: u32,
    tail: u32,
    flags: EpochFlags,
    /// Gap the firmware requires between producer and consumer.
    reserved_gap: u32,
    aux: Option<AuxBuffer>,
}

impl RingQueue {
    pub(crate) fn new(depth: u32, stride: u32, reserved_gap: u32) -> Self {
        assert!(depth > 0, "invalid ring depth");
        Self {
            region: Arc::new(DmaRegion::new(depth as usize * stride as usize)),
            depth,
            stride,
            head: 0,
            tail: 0,
            flags: EpochFlags::empty(),
            reserved_gap,
            aux: None,
        }
    }

    pub(crate) fn with_aux(mut self, aux: AuxBuffer) -> Self {
        self.aux = Some(aux);
        self
    }

    pub(crate) fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    pub(crate) fn aux(&self) -> Option<&AuxBuffer> {
        self.aux.as_ref()
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn stride(&self) -> u32 {
        self.stride
    }

    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    pub(crate) fn tail(&self) -> u32 {
        self.tail
    }

    pub(crate) fn head_epoch(&self) -> bool {
        self.flags.contains(EpochFlags::HEAD)
    }

    pub(crate) fn tail_epoch(&self) -> bool {
        self.flags.contains(EpochFlags::TAIL)
    }

    /// Slots currently between consumer and producer.
    pub(crate) fn occupancy(&self) -> u32 {
        if self.head_epoch() == self.tail_epoch() {
            self.tail - self.head
        } else {
            self.depth - self.head + self.tail
        }
    }

    pub(crate) fn free_slots(&self) -> u32 {
        self.depth - self.occupancy()
    }

    pub(crate) fn is_full(&self, needed_slots: u32) -> bool {
        self.free_slots() < needed_slots + self.reserved_gap
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail && self.head_epoch() == self.tail_epoch()
    }

    /// Byte offset of the slot `index` positions past the producer cursor.
    pub(crate) fn slot_at(&self, index: u32) -> usize {
        ((self.tail + index) % self.depth) as usize * self.stride as usize
    }

    /// Byte offset of the slot under the consumer cursor.
    pub(crate) fn head_slot(&self) -> usize {
        self.head as usize * self.stride as usize
    }

    pub(crate) fn write_slot(&self, index: u32, data: &[u8]) {
        self.region.write(self.slot_at(index), data);
    }

    pub(crate) fn advance_tail(&mut self, n: u32) {
        self.tail = Self::advance(self.tail, n, self.depth, &mut self.flags, EpochFlags::TAIL);
    }

    pub(crate) fn advance_head(&mut self, n: u32) {
        self.head = Self::advance(self.head, n, self.depth, &mut self.flags, EpochFlags::HEAD);
    }

    /// Empty the ring and zero its memory.
    pub(crate) fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.flags = EpochFlags::empty();
        self.region.fill(0, self.region.len(), 0);
    }

    fn advance(cursor: u32, n: u32, depth: u32, flags: &mut EpochFlags, epoch: EpochFlags) -> u32 {
        let mut next = cursor + n;
        while next >= depth {
            next -= depth;
            flags.toggle(epoch);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slots_after_posts() {
        let mut ring = RingQueue::new(8, 16, 0);
        for n in [1, 3, 2] {
            ring.advance_tail(n);
        }
        assert_eq!(ring.free_slots(), 2);
        assert!(!ring.is_full(2));
        assert!(ring.is_full(3));

        ring.advance_head(4);
        assert_eq!(ring.free_slots(), 6);
    }

    #[test]
    fn test_full_at_depth_with_single_slot_requests() {
        let mut ring = RingQueue::new(8, 16, 0);
        for _ in 0..8 {
            assert!(!ring.is_full(1));
            ring.advance_tail(1);
        }
        assert!(ring.is_full(1));
        assert!(!ring.is_empty());
        assert_eq!(ring.tail(), ring.head());
    }

    #[test]
    fn test_reserved_gap_counts_against_fullness() {
        let mut ring = RingQueue::new(8, 16, 2);
        ring.advance_tail(5);
        assert!(!ring.is_full(1));
        assert!(ring.is_full(2));
        assert_eq!(ring.depth(), 8);
    }

    #[test]
    fn test_epoch_flips_once_per_traversal() {
        let mut ring = RingQueue::new(8, 16, 0);
        for _ in 0..8 {
            assert!(!ring.tail_epoch());
            ring.advance_tail(1);
        }
        assert!(ring.tail_epoch());
        assert_eq!(ring.tail(), 0);

        for _ in 0..8 {
            ring.advance_head(1);
        }
        assert!(ring.head_epoch());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_non_power_of_two_depth() {
        let mut ring = RingQueue::new(6, 16, 0);
        ring.advance_tail(4);
        ring.advance_head(4);
        ring.advance_tail(4);
        assert_eq!(ring.tail(), 2);
        assert!(ring.tail_epoch());
        assert_eq!(ring.occupancy(), 4);
        assert_eq!(ring.slot_at(1), 3 * 16);
    }

    #[test]
    fn test_write_slot_relative_to_tail() {
        let mut ring = RingQueue::new(4, 16, 0);
        ring.advance_tail(3);
        ring.write_slot(1, &[7u8; 16]);
        assert_eq!(ring.region().read_u8_volatile(0), 7);
    }

    #[test]
    fn test_aux_buffer_wraps() {
        let aux = AuxBuffer::new(4, 8);
        aux.write(5, &[1u8; 8]);
        let mut buf = [0u8; 8];
        aux.read(1, &mut buf);
        assert_eq!(buf, [1u8; 8]);
        assert_eq!(aux.entries(), 4);
    }
}
