use crate::{
    cq::CqContext,
    device::{constants::CQE_SIZE, CqCreateReq, DeviceAdaptor, DeviceAttr, DmaRegion, RingInfo},
    doorbell::{DoorbellEngine, RecoveryLists, RecoveryTask},
    push::PushBufferPool,
    qp::QpContext,
    registry::{Handle, Registry},
    srq::SrqContext,
};
use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

mod config;
mod doorbell;
mod lock;
mod poll;
mod push;
mod queue;
mod registry;
mod types;
mod utils;
mod wqe;

pub mod cq;
pub mod device;
pub mod qp;
pub mod srq;

pub use crate::{
    config::{Config, WqeMode},
    cq::Cq,
    doorbell::{DbrRecoveryPage, DoorbellKey, PacingData},
    qp::{Qp, QpInitAttr},
    srq::{Srq, SrqInitAttr},
    types::{
        Error, Imm, Key, MwAccessFlags, Pmtu, PostError, Psn, QpState, QpType, Qpn, RecvWr,
        SendFlags, SendOp, SendWr, Sge, ThreeBytesStruct, UdDest, WcFlags, WcOpcode, WcStatus,
        WorkCompletion,
    },
};

/// An opened device context. Cheap to clone, all clones share the queues.
#[derive(Clone)]
pub struct Context(Arc<ContextInner<dyn DeviceAdaptor>>);

pub(crate) struct ContextInner<D: ?Sized + DeviceAdaptor> {
    pub(crate) config: Config,
    pub(crate) qps: RwLock<Registry<QpContext>>,
    pub(crate) cqs: RwLock<Registry<CqContext>>,
    pub(crate) srqs: RwLock<Registry<SrqContext>>,
    /// Present when doorbell drop recovery is enabled.
    pub(crate) recovery: Option<RecoveryLists>,
    pub(crate) doorbells: DoorbellEngine,
    pub(crate) push_buffers: PushBufferPool,
    sentinel: SentinelCq,
    recovery_task: Mutex<Option<RecoveryTask>>,
    pub(crate) adaptor: D,
}

/// One entry CQ owned by the context. Its event channel drives recovery and
/// the pacing alarm drains it.
struct SentinelCq {
    id: u32,
    _ring: Arc<DmaRegion>,
}

impl Context {
    pub fn new<D: DeviceAdaptor + 'static>(adaptor: D, config: Config) -> Result<Self, Error> {
        let ring = Arc::new(DmaRegion::new(CQE_SIZE));
        let res = adaptor.control().create_cq(&CqCreateReq {
            handle: 0,
            ring: RingInfo {
                region: Arc::clone(&ring),
                depth: 1,
                stride: CQE_SIZE as u32,
                fixed_wqe_slots: None,
            },
        })?;

        let attr = adaptor.attr();
        let recovery_enabled =
            config.drop_recovery && attr.drop_recovery && adaptor.recovery_page().is_some();
        let push_enabled = config.push && attr.push;
        let events = if recovery_enabled {
            adaptor.event_channel()
        } else {
            None
        };

        let inner: Arc<ContextInner<dyn DeviceAdaptor>> = Arc::new(ContextInner {
            qps: RwLock::new(Registry::new()),
            cqs: RwLock::new(Registry::new()),
            srqs: RwLock::new(Registry::new()),
            recovery: recovery_enabled.then(RecoveryLists::default),
            doorbells: DoorbellEngine::new(Some(res.id)),
            push_buffers: PushBufferPool::new(push_enabled),
            sentinel: SentinelCq {
                id: res.id,
                _ring: ring,
            },
            recovery_task: Mutex::new(None),
            config,
            adaptor,
        });

        if let Some(events) = events {
            let task = RecoveryTask::spawn(Arc::downgrade(&inner), events)
                .map_err(|err| Error::Device(Box::new(err)))?;
            *lock::lock(&inner.recovery_task) = Some(task);
            info!("doorbell drop recovery enabled");
        }

        Ok(Self(inner))
    }

    pub fn attr(&self) -> &DeviceAttr {
        self.0.adaptor.attr()
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Identifier of the context's own CQ.
    pub fn sentinel_cq_id(&self) -> u32 {
        self.0.sentinel.id
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    pub(crate) fn lookup_qp(&self, handle: Handle) -> Option<Arc<QpContext>> {
        lock::read(&self.qps).get(handle).cloned()
    }

    pub(crate) fn lookup_cq(&self, handle: Handle) -> Option<Arc<CqContext>> {
        lock::read(&self.cqs).get(handle).cloned()
    }

    pub(crate) fn lookup_srq(&self, handle: Handle) -> Option<Arc<SrqContext>> {
        lock::read(&self.srqs).get(handle).cloned()
    }
}

impl<D: ?Sized + DeviceAdaptor> Drop for ContextInner<D> {
    fn drop(&mut self) {
        let task = self
            .recovery_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(task);
        if let Err(err) = self.adaptor.control().destroy_cq(self.sentinel.id) {
            warn!("failed to destroy sentinel CQ {}: {err}", self.sentinel.id);
        }
    }
}
