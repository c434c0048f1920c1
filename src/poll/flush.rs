use crate::{
    cq::CqContext,
    device::DeviceAdaptor,
    lock,
    qp::{QpContext, QpInner},
    registry::Handle,
    types::{Qpn, WcOpcode, WcStatus, WorkCompletion},
    ContextInner,
};
use log::debug;
use std::sync::atomic::Ordering;

fn flush_error(qpn: Qpn, wr_id: u64, opcode: WcOpcode) -> WorkCompletion {
    WorkCompletion::new(wr_id, WcStatus::WrFlushErr, opcode, qpn)
}

fn flush_sq(qpn: Qpn, inner: &mut QpInner, out: &mut Vec<WorkCompletion>, budget: &mut usize) {
    while *budget > 0 {
        let Some(slot) = inner.sq.retire_oldest() else {
            return;
        };
        out.push(flush_error(qpn, slot.wr_id, slot.opcode));
        *budget -= 1;
    }
}

fn flush_rq(qpn: Qpn, inner: &mut QpInner, out: &mut Vec<WorkCompletion>, budget: &mut usize) {
    let Some(rq) = inner.rq.as_mut() else {
        return;
    };
    while *budget > 0 {
        let Some(slot) = rq.retire_oldest() else {
            return;
        };
        out.push(flush_error(qpn, slot.wr_id, slot.opcode));
        *budget -= 1;
    }
}

impl ContextInner<dyn DeviceAdaptor> {
    /// Put the QP on the send flush list of its send CQ and, unless it
    /// receives through an SRQ, on the receive flush list of its receive CQ.
    /// A QP already on a list is not added twice.
    pub(crate) fn add_flush_qp(&self, qp: &QpContext) {
        {
            let mut lists = lock::lock(&qp.send_cq.flush);
            if !qp.sq_flushed.swap(true, Ordering::AcqRel) {
                lists.sq.push_back(qp.handle);
                debug!("QP {} added to send flush list of CQ {}", qp.qpn.get(), qp.send_cq.id);
            }
        }
        if qp.srq.is_some() {
            return;
        }
        let mut lists = lock::lock(&qp.recv_cq.flush);
        if !qp.rq_flushed.swap(true, Ordering::AcqRel) {
            lists.rq.push_back(qp.handle);
            debug!("QP {} added to receive flush list of CQ {}", qp.qpn.get(), qp.recv_cq.id);
        }
    }

    /// Take the QP off every flush list it is on.
    pub(crate) fn remove_flush_qp(&self, qp: &QpContext) {
        {
            let mut lists = lock::lock(&qp.send_cq.flush);
            lists.sq.retain(|h| *h != qp.handle);
            qp.sq_flushed.store(false, Ordering::Release);
        }
        let mut lists = lock::lock(&qp.recv_cq.flush);
        lists.rq.retain(|h| *h != qp.handle);
        qp.rq_flushed.store(false, Ordering::Release);
    }

    /// Complete the outstanding requests of every flushed QP with flush
    /// errors. QPs stay listed until they are reset or destroyed.
    pub(crate) fn drain_flush_lists(
        &self,
        cq: &CqContext,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) {
        let (sq, rq): (Vec<Handle>, Vec<Handle>) = {
            let lists = lock::lock(&cq.flush);
            (
                lists.sq.iter().copied().collect(),
                lists.rq.iter().copied().collect(),
            )
        };
        for handle in sq {
            if *budget == 0 {
                return;
            }
            let Some(qp) = self.lookup_qp(handle) else {
                continue;
            };
            let mut inner = qp.inner.lock();
            flush_sq(qp.qpn, &mut inner, out, budget);
        }
        for handle in rq {
            if *budget == 0 {
                return;
            }
            let Some(qp) = self.lookup_qp(handle) else {
                continue;
            };
            let mut inner = qp.inner.lock();
            flush_rq(qp.qpn, &mut inner, out, budget);
        }
    }
}
