use super::{dma::PAGE_SIZE, ControlPath, DeviceAdaptor, DeviceAttr, DeviceEvent};
use crate::doorbell::{DbrRecoveryPage, PacingData};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use std::{
    fs::OpenOptions,
    io,
    mem::size_of,
    os::fd::AsRawFd,
    path::PathBuf,
    ptr::{self, NonNull},
};

/// Where the device registers live in the mapped BAR.
#[derive(Debug, Clone)]
pub struct HardwareConfig {
    /// Resource file of the BAR, e.g. `/sys/bus/pci/devices/.../resource0`.
    pub bar_path: PathBuf,
    pub bar_len: usize,
    /// Start of the doorbell pages. Page `n` is at `db_offset + n * PAGE_SIZE`.
    pub db_offset: usize,
    pub fifo_offset: usize,
    /// Write combining push buffers, one page each.
    pub push_offset: Option<usize>,
    /// File exposing the kernel's pacing page followed by the recovery page.
    pub shared_pages_path: Option<PathBuf>,
    pub attr: DeviceAttr,
}

/// A `MAP_SHARED` mapping of part of a file.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(path: &PathBuf, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: calling mmap as documented to create a new mapping.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::Other))?;
        Ok(Self { ptr, len })
    }

    fn checked(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(offset + len <= self.len, "register access out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    fn write_u64(&self, offset: usize, val: u64) {
        let p = self.checked(offset, size_of::<u64>()).cast::<u64>();
        // SAFETY: in bounds and 8 byte aligned for every doorbell offset.
        unsafe { ptr::write_volatile(p, val) }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let p = self.checked(offset, size_of::<u32>()).cast::<u32>();
        // SAFETY: in bounds, registers are 4 byte aligned.
        unsafe { ptr::read_volatile(p) }
    }

    /// Copy in 8 byte words, write combining buffers reject narrower stores.
    fn copy_words(&self, offset: usize, data: &[u8]) {
        let base = self.checked(offset, data.len().next_multiple_of(8));
        for (i, chunk) in data.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            // SAFETY: the whole padded range was bounds checked.
            unsafe { ptr::write_volatile(base.add(i * 8).cast::<u64>(), u64::from_ne_bytes(word)) }
        }
    }

    /// # Safety
    ///
    /// `T` must be `repr(C)`, valid for any bit pattern and only ever
    /// accessed through atomics.
    unsafe fn view<T>(&self, offset: usize) -> &T {
        &*self.checked(offset, size_of::<T>()).cast::<T>()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping memory mapped at construction.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: this is just a pointer value into device memory.
unsafe impl Send for Mapping {}
// SAFETY: see above comment
unsafe impl Sync for Mapping {}

/// Adaptor for a real NIC. Doorbells and pushes go straight to the mapped
/// BAR. Control operations are forwarded to the kernel through `control`.
pub struct HardwareDevice {
    attr: DeviceAttr,
    bar: Mapping,
    db_offset: usize,
    fifo_offset: usize,
    push_offset: Option<usize>,
    shared: Option<Mapping>,
    control: Box<dyn ControlPath>,
    events: Option<Receiver<DeviceEvent>>,
    acks: Option<Sender<()>>,
}

impl HardwareDevice {
    pub fn open(config: HardwareConfig, control: Box<dyn ControlPath>) -> io::Result<Self> {
        let bar = Mapping::new(&config.bar_path, config.bar_len)?;
        let shared = config
            .shared_pages_path
            .as_ref()
            .map(|path| Mapping::new(path, 2 * PAGE_SIZE))
            .transpose()?;
        info!(
            "mapped {:#x} bytes of {}",
            config.bar_len,
            config.bar_path.display()
        );
        Ok(Self {
            attr: config.attr,
            bar,
            db_offset: config.db_offset,
            fifo_offset: config.fifo_offset,
            push_offset: config.push_offset,
            shared,
            control,
            events: None,
            acks: None,
        })
    }

    /// Route doorbell drop notifications from the kernel. Every handled
    /// event is acknowledged on `acks`.
    pub fn with_events(mut self, events: Receiver<DeviceEvent>, acks: Sender<()>) -> Self {
        self.events = Some(events);
        self.acks = Some(acks);
        self
    }
}

impl DeviceAdaptor for HardwareDevice {
    fn attr(&self) -> &DeviceAttr {
        &self.attr
    }

    fn control(&self) -> &dyn ControlPath {
        self.control.as_ref()
    }

    fn write_doorbell(&self, db_page: u32, key: u64) {
        self.bar
            .write_u64(self.db_offset + db_page as usize * PAGE_SIZE, key);
    }

    fn read_fifo_register(&self) -> u32 {
        self.bar.read_u32(self.fifo_offset)
    }

    fn write_push_buffer(&self, buffer: usize, data: &[u8]) {
        let Some(base) = self.push_offset else {
            debug!("push buffer {buffer} written without push mapping");
            return;
        };
        self.bar.copy_words(base + buffer * PAGE_SIZE, data);
    }

    fn pacing_data(&self) -> Option<&PacingData> {
        // SAFETY: PacingData is repr(C) atomics, the kernel lays it out at
        // the start of the first shared page.
        self.shared.as_ref().map(|m| unsafe { m.view::<PacingData>(0) })
    }

    fn recovery_page(&self) -> Option<&DbrRecoveryPage> {
        if !self.attr.drop_recovery {
            return None;
        }
        // SAFETY: DbrRecoveryPage is repr(C) atomics at the start of the
        // second shared page.
        self.shared
            .as_ref()
            .map(|m| unsafe { m.view::<DbrRecoveryPage>(PAGE_SIZE) })
    }

    fn event_channel(&self) -> Option<Receiver<DeviceEvent>> {
        self.events.clone()
    }

    fn ack_event(&self) {
        if let Some(acks) = &self.acks {
            if acks.send(()).is_err() {
                debug!("event acknowledgement dropped, no listener");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Write,
        sync::atomic::Ordering,
    };

    fn backing_file(len: usize) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "roce-datapath-bar-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        (path, file)
    }

    #[test]
    fn test_doorbell_lands_in_page() {
        let (path, _file) = backing_file(4 * PAGE_SIZE);
        let map = Mapping::new(&path, 4 * PAGE_SIZE).unwrap();
        map.write_u64(PAGE_SIZE * 2, 0x1122_3344_5566_7788);
        assert_eq!(map.read_u32(PAGE_SIZE * 2), 0x5566_7788);
        map.copy_words(8, &[1, 2, 3]);
        assert_eq!(map.read_u32(8), 0x0003_0201);
        drop(map);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_shared_pages_view() {
        let (path, _file) = backing_file(2 * PAGE_SIZE);
        let map = Mapping::new(&path, 2 * PAGE_SIZE).unwrap();
        // SAFETY: both pages are zeroed plain memory.
        let page = unsafe { map.view::<DbrRecoveryPage>(PAGE_SIZE) };
        page.epoch.store(3, Ordering::Release);
        assert_eq!(map.read_u32(PAGE_SIZE), 3);
        drop(map);
        std::fs::remove_file(path).unwrap();
    }
}
