use crate::device::constants::{PACING_MAX_WAIT_US, PACING_PROBABILITY_RANGE};
use std::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};
use thiserror::Error;

/// Pacing page shared with the kernel, refreshed out of band. Read only here.
#[repr(C)]
#[derive(Debug, Default)]
pub struct PacingData {
    /// Probability out of 0xffff that a doorbell is paced.
    pub do_pacing: AtomicU32,
    pub pacing_th: AtomicU32,
    pub alarm_th: AtomicU32,
    pub dev_err_state: AtomicU32,
}

#[derive(Debug, Error)]
#[error("device in error state")]
pub(crate) struct DeviceInError;

pub(crate) fn xorshift32(seed: &AtomicU32) -> u32 {
    let mut x = seed.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    seed.store(x, Ordering::Relaxed);
    x
}

fn busy_wait(us: u32) {
    let deadline = Instant::now() + Duration::from_micros(us as u64);
    while Instant::now() < deadline {
        hint::spin_loop();
    }
}

/// Hold back a doorbell while the shared doorbell FIFO is congested.
///
/// `occupancy` reads the live FIFO fill level and `drain` pulls one
/// completion off the context's own CQ. Returns how many backoff waits were
/// spent, or an error if the device is recovering and the doorbell must be
/// dropped.
pub(crate) fn pace(
    data: &PacingData,
    seed: &AtomicU32,
    mut occupancy: impl FnMut() -> u32,
    mut drain: impl FnMut(),
) -> Result<u32, DeviceInError> {
    if data.dev_err_state.load(Ordering::Acquire) != 0 {
        return Err(DeviceInError);
    }

    let rnd = xorshift32(seed);
    if rnd % PACING_PROBABILITY_RANGE >= data.do_pacing.load(Ordering::Relaxed) {
        return Ok(0);
    }

    let mut wait_us = 1;
    let mut waits = 0;
    loop {
        let occup = occupancy();
        if occup <= data.pacing_th.load(Ordering::Relaxed) {
            return Ok(waits);
        }
        if occup > data.alarm_th.load(Ordering::Relaxed) {
            drain();
        }
        busy_wait(wait_us + rnd % wait_us);
        waits += 1;
        wait_us = (wait_us * 2).min(PACING_MAX_WAIT_US);

        if data.dev_err_state.load(Ordering::Acquire) != 0 {
            return Err(DeviceInError);
        }
    }
}
