use std::{
    ptr,
    slice,
    sync::atomic::{fence, Ordering},
};

pub(crate) const PAGE_SIZE: usize = 4096;

/// Zeroed, page aligned host memory shared with the device.
pub struct DmaRegion {
    buf: *mut u8,
    len: usize,
    buf_padding: usize,
}

// SAFETY: the region is plain memory. Callers serialize writers per queue and
// the device side only touches it through the same volatile accessors.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    pub(crate) fn new(len: usize) -> Self {
        let len = len.max(1);
        let raw_buf = Box::leak(vec![0u8; len + PAGE_SIZE].into_boxed_slice());
        let buf_padding = (PAGE_SIZE - (raw_buf.as_ptr() as usize & (PAGE_SIZE - 1))) % PAGE_SIZE;
        let buf = raw_buf[buf_padding..].as_mut_ptr();

        Self {
            buf,
            len,
            buf_padding,
        }
    }

    pub fn addr(&self) -> u64 {
        self.buf as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "dma write out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.buf.add(offset), data.len()) }
    }

    pub fn read(&self, offset: usize, data: &mut [u8]) {
        assert!(offset + data.len() <= self.len, "dma read out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(self.buf.add(offset), data.as_mut_ptr(), data.len()) }
    }

    /// Single byte read the device may change underneath us.
    pub fn read_u8_volatile(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "dma read out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::read_volatile(self.buf.add(offset)) }
    }

    pub fn write_u8_volatile(&self, offset: usize, val: u8) {
        assert!(offset < self.len, "dma write out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::write_volatile(self.buf.add(offset), val) }
    }

    pub fn fill(&self, offset: usize, len: usize, val: u8) {
        assert!(offset + len <= self.len, "dma write out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::write_bytes(self.buf.add(offset), val, len) }
    }

    /// Order descriptor stores before a following doorbell write.
    pub(crate) fn flush_writes() {
        fence(Ordering::Release);
    }

    /// Order a validity check before reading the rest of an entry.
    pub(crate) fn read_barrier() {
        fence(Ordering::Acquire);
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: `buf - buf_padding` is the start of the slice leaked in
        // `new`, which was `len + PAGE_SIZE` bytes long.
        let raw_buf = unsafe {
            slice::from_raw_parts_mut(self.buf.sub(self.buf_padding), self.len + PAGE_SIZE)
        };

        // SAFETY: the slice came from `Box::leak` and is released only here.
        drop(unsafe { Box::from_raw(raw_buf) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_page_aligned_and_zeroed() {
        let region = DmaRegion::new(100);
        assert_eq!(region.addr() as usize & (PAGE_SIZE - 1), 0);
        let mut buf = [0xffu8; 100];
        region.read(0, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_read_write() {
        let region = DmaRegion::new(64);
        region.write(16, &[1, 2, 3]);
        assert_eq!(region.read_u8_volatile(17), 2);
        region.write_u8_volatile(18, 9);
        let mut buf = [0u8; 3];
        region.read(16, &mut buf);
        assert_eq!(buf, [1, 2, 9]);
        region.fill(16, 3, 0);
        assert_eq!(region.read_u8_volatile(16), 0);
    }
}
