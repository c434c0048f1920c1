use crate::device::{
    constants::{DB_KEY_INVALID, DB_PATH_ROCE},
    DeviceAdaptor, DmaRegion,
};
use bitfield::bitfield;
use log::debug;
use rand::Rng;
use std::{
    hint,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

mod pacing;
mod recovery;

pub use self::{pacing::PacingData, recovery::DbrRecoveryPage};
pub(crate) use self::recovery::{QueueKind, RecoveryLists, RecoveryTask};

bitfield! {
    /// 64-bit doorbell value written to the doorbell page.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DoorbellKey(u64);
    impl Debug;
    u32;
    pub index, set_index: 23, 0;        // 24bits
    pub epoch, set_epoch: 24;           // 1bit
    pub toggle, set_toggle: 26, 25;     // 2bits
    pub xid, set_xid: 51, 32;           // 20bits
    pub path, set_path: 57, 56;         // 2bits
    pub valid, set_valid: 58;           // 1bit
    pub db_type, set_db_type: 63, 60;   // 4bits
}

impl DoorbellKey {
    pub fn build(db_type: u32, xid: u32, index: u32, epoch: bool, toggle: u32) -> Self {
        let mut key = DoorbellKey(0);
        key.set_index(index);
        key.set_epoch(epoch);
        key.set_toggle(toggle);
        key.set_xid(xid);
        key.set_path(DB_PATH_ROCE);
        key.set_valid(true);
        key.set_db_type(db_type);
        key
    }

    pub fn from_raw(raw: u64) -> Self {
        DoorbellKey(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per queue doorbell state shared between the owning queue and the recovery
/// task.
pub(crate) struct Doorbell {
    db_page: u32,
    xid: u32,
    /// Last key written, or `DB_KEY_INVALID` if never rung.
    shadow_key: AtomicU64,
    lock: AtomicBool,
    seed: AtomicU32,
}

impl Doorbell {
    pub(crate) fn new(db_page: u32, xid: u32) -> Self {
        Self {
            db_page,
            xid,
            shadow_key: AtomicU64::new(DB_KEY_INVALID),
            lock: AtomicBool::new(false),
            // xorshift never leaves zero
            seed: AtomicU32::new(rand::thread_rng().gen::<u32>() | 1),
        }
    }

    pub(crate) fn key(&self, db_type: u32, index: u32, epoch: bool, toggle: u32) -> DoorbellKey {
        DoorbellKey::build(db_type, self.xid, index, epoch, toggle)
    }

    pub(crate) fn shadow_key(&self) -> u64 {
        self.shadow_key.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

/// Writes doorbells after consulting the pacing state.
pub(crate) struct DoorbellEngine {
    /// Kernel owned CQ drained when the FIFO crosses the alarm threshold.
    sentinel_cq: Option<u32>,
}

impl DoorbellEngine {
    pub(crate) fn new(sentinel_cq: Option<u32>) -> Self {
        Self { sentinel_cq }
    }

    /// Returns false if the doorbell was suppressed because the device is in
    /// error state.
    pub(crate) fn ring(&self, dev: &dyn DeviceAdaptor, db: &Doorbell, key: DoorbellKey) -> bool {
        if !self.pace(dev, db) {
            return false;
        }
        db.acquire();
        db.shadow_key.store(key.raw(), Ordering::Release);
        DmaRegion::flush_writes();
        dev.write_doorbell(db.db_page, key.raw());
        DmaRegion::flush_writes();
        db.release();
        true
    }

    /// Re-send the last key. The shadow key itself is left untouched.
    pub(crate) fn replay(&self, dev: &dyn DeviceAdaptor, db: &Doorbell) -> bool {
        if db.shadow_key() == DB_KEY_INVALID {
            return false;
        }
        if !self.pace(dev, db) {
            return false;
        }
        db.acquire();
        let key = db.shadow_key.load(Ordering::Acquire);
        DmaRegion::flush_writes();
        dev.write_doorbell(db.db_page, key);
        DmaRegion::flush_writes();
        db.release();
        true
    }

    fn pace(&self, dev: &dyn DeviceAdaptor, db: &Doorbell) -> bool {
        let Some(data) = dev.pacing_data() else {
            return true;
        };
        let fifo = dev.attr().fifo();
        let result = pacing::pace(
            data,
            &db.seed,
            || fifo.occupancy(dev.read_fifo_register()),
            || {
                if let Some(cq) = self.sentinel_cq {
                    if let Err(err) = dev.control().poll_kernel_cq(cq) {
                        debug!("draining sentinel CQ {cq} failed: {err}");
                    }
                }
            },
        );
        match result {
            Ok(_) => true,
            Err(err) => {
                debug!("doorbell for xid {} dropped: {err}", db.xid);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{DB_TYPE_CQ, DB_TYPE_SQ};

    #[test]
    fn test_key_layout() {
        let key = DoorbellKey::build(DB_TYPE_SQ, 0xabcde, 0x12_3456, true, 0x2);
        let raw = key.raw();
        assert_eq!(raw & 0xff_ffff, 0x12_3456);
        assert_eq!((raw >> 24) & 1, 1);
        assert_eq!((raw >> 25) & 0x3, 0x2);
        assert_eq!((raw >> 32) & 0xf_ffff, 0xabcde);
        assert_eq!((raw >> 56) & 0x3, DB_PATH_ROCE as u64);
        assert_eq!((raw >> 58) & 1, 1);
        assert_eq!(raw >> 60, DB_TYPE_SQ as u64);
    }

    #[test]
    fn test_key_fields_are_masked() {
        let key = DoorbellKey::build(DB_TYPE_CQ, 0x1f_ffff, 0x1ff_ffff, false, 0);
        assert_eq!(key.xid(), 0xf_ffff);
        assert_eq!(key.index(), 0xff_ffff);
        assert_eq!(key.db_type(), DB_TYPE_CQ);
        assert!(!key.epoch());
    }

    #[test]
    fn test_new_doorbell_has_invalid_shadow() {
        let db = Doorbell::new(1, 7);
        assert_eq!(db.shadow_key(), DB_KEY_INVALID);
        assert_eq!(db.xid, 7);
        assert_ne!(db.seed.load(Ordering::Relaxed), 0);
    }
}
