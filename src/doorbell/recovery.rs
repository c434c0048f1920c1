use crate::{
    device::{DeviceAdaptor, DeviceEvent},
    registry::Handle,
    ContextInner,
};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
};

/// Epoch pair shared with the kernel. The kernel bumps `epoch` when the
/// device dropped doorbells, userspace echoes it into `epoch_ack` once every
/// live queue has been rung again.
#[repr(C)]
#[derive(Debug, Default)]
pub struct DbrRecoveryPage {
    pub epoch: AtomicU32,
    pub epoch_ack: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Qp,
    Cq,
    Srq,
}

/// Live queues whose doorbells are replayed after a drop.
#[derive(Default)]
pub(crate) struct RecoveryLists {
    qps: Mutex<Vec<Handle>>,
    cqs: Mutex<Vec<Handle>>,
    srqs: Mutex<Vec<Handle>>,
}

impl RecoveryLists {
    fn list(&self, kind: QueueKind) -> MutexGuard<'_, Vec<Handle>> {
        let list = match kind {
            QueueKind::Qp => &self.qps,
            QueueKind::Cq => &self.cqs,
            QueueKind::Srq => &self.srqs,
        };
        list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, kind: QueueKind, handle: Handle) {
        self.list(kind).push(handle);
    }

    pub(crate) fn remove(&self, kind: QueueKind, handle: Handle) {
        self.list(kind).retain(|h| *h != handle);
    }

    #[cfg(test)]
    pub(crate) fn len(&self, kind: QueueKind) -> usize {
        self.list(kind).len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryOutcome {
    /// Epoch already acknowledged, nothing was replayed.
    FalseAlarm,
    Replayed(usize),
}

/// Counts replays and yields the thread every `interval` of them.
struct Pacer {
    interval: u32,
    since_yield: u32,
    replayed: usize,
}

impl Pacer {
    fn record(&mut self) {
        self.replayed += 1;
        self.since_yield += 1;
        if self.since_yield >= self.interval {
            self.since_yield = 0;
            thread::yield_now();
        }
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    /// Re-send the last doorbell of every live queue, then acknowledge the
    /// epoch that triggered the walk.
    pub(crate) fn recover_doorbells(&self) -> RecoveryOutcome {
        let Some(page) = self.adaptor.recovery_page() else {
            return RecoveryOutcome::FalseAlarm;
        };
        let epoch = page.epoch.load(Ordering::Acquire);
        if epoch == page.epoch_ack.load(Ordering::Acquire) {
            debug!("doorbell recovery: epoch {epoch} already acknowledged");
            return RecoveryOutcome::FalseAlarm;
        }
        let Some(lists) = &self.recovery else {
            return RecoveryOutcome::FalseAlarm;
        };

        let mut pacer = Pacer {
            interval: self.config.recovery_yield_interval.max(1),
            since_yield: 0,
            replayed: 0,
        };

        for handle in lists.list(QueueKind::Qp).iter() {
            let Some(qp) = self.lookup_qp(*handle) else {
                continue;
            };
            for db in [&qp.sq_db, &qp.rq_db] {
                if self.doorbells.replay(&self.adaptor, db) {
                    pacer.record();
                }
            }
        }
        for handle in lists.list(QueueKind::Cq).iter() {
            let Some(cq) = self.lookup_cq(*handle) else {
                continue;
            };
            if self.doorbells.replay(&self.adaptor, &cq.db) {
                pacer.record();
            }
        }
        for handle in lists.list(QueueKind::Srq).iter() {
            let Some(srq) = self.lookup_srq(*handle) else {
                continue;
            };
            if self.doorbells.replay(&self.adaptor, &srq.db) {
                pacer.record();
            }
        }

        page.epoch_ack.store(epoch, Ordering::Release);
        RecoveryOutcome::Replayed(pacer.replayed)
    }
}

/// Background thread waiting for doorbell drop events.
pub(crate) struct RecoveryTask {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RecoveryTask {
    pub(crate) fn spawn(
        ctx: Weak<ContextInner<dyn DeviceAdaptor>>,
        events: Receiver<DeviceEvent>,
    ) -> io::Result<Self> {
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("dbr-recovery".to_owned())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(cancelled) -> _ => return,
                    recv(events) -> event => {
                        let Ok(DeviceEvent::DoorbellDrop) = event else {
                            return;
                        };
                        let Some(ctx) = ctx.upgrade() else {
                            return;
                        };
                        match ctx.recover_doorbells() {
                            RecoveryOutcome::FalseAlarm => {
                                debug!("doorbell drop event was a false alarm");
                            }
                            RecoveryOutcome::Replayed(n) => {
                                info!("doorbell recovery replayed {n} doorbells");
                            }
                        }
                        ctx.adaptor.ack_event();
                    }
                }
            })?;
        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }
}

impl Drop for RecoveryTask {
    fn drop(&mut self) {
        // disconnecting the cancel channel wakes the select
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            // the last context reference may be released by the task itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("doorbell recovery thread panicked");
            }
        }
    }
}
