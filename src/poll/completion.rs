use crate::{
    device::{
        constants::CQE_CONS_IDX_NONE,
        types::{req_status_to_wc, res_status_to_wc, Cqe, CqeFlags, ResStatus},
        DeviceAdaptor,
    },
    qp::{QpContext, QpInner},
    registry::Handle,
    types::{Imm, Key, QpState, Qpn, WcFlags, WcOpcode, WcStatus, WorkCompletion},
    ContextInner,
};
use log::{debug, warn};
use std::sync::{atomic::Ordering, Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CqeAction {
    /// Entry handled, advance past it.
    Consume,
    /// Out of result quota, leave the entry for the next poll.
    Retry,
    /// Resize switch marker, advance and stop.
    Cutoff,
}

/// Fields shared by the RC and UD responder entries.
struct ResCqe {
    qp_handle: u64,
    length: u32,
    imm_or_inv: u32,
    wr_idx: u32,
    flags: CqeFlags,
    src_qp: Option<u32>,
    status: u8,
}

enum SendWalk {
    /// Every request before the consumer index retired.
    Done,
    /// The last retired request carried an error.
    Failed,
    OutOfBudget,
}

/// Retire send records up to, not including, `cons`. Signaled requests
/// produce results and the request right before `cons` reports
/// `last_status`.
fn retire_sends(
    qpn: Qpn,
    inner: &mut QpInner,
    cons: u32,
    last_status: WcStatus,
    out: &mut Vec<WorkCompletion>,
    budget: &mut usize,
) -> SendWalk {
    while let Some(idx) = inner.sq.oldest() {
        if idx == cons {
            break;
        }
        let Some(slot) = inner.sq.slot(idx).copied() else {
            break;
        };
        let failed = slot.next == Some(cons) && last_status != WcStatus::Success;
        if slot.signaled || failed {
            if *budget == 0 {
                return SendWalk::OutOfBudget;
            }
            let status = if failed {
                last_status
            } else {
                WcStatus::Success
            };
            let mut wc = WorkCompletion::new(slot.wr_id, status, slot.opcode, qpn);
            wc.byte_len = slot.byte_count;
            out.push(wc);
            *budget -= 1;
        }
        inner.sq.retire_oldest();
        if failed {
            return SendWalk::Failed;
        }
    }
    SendWalk::Done
}

impl ContextInner<dyn DeviceAdaptor> {
    pub(super) fn handle_cqe(
        &self,
        cqe: Cqe,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) -> CqeAction {
        match cqe {
            Cqe::Req {
                qp_handle,
                sq_cons_idx,
                status,
            } => self.handle_cqe_req(qp_handle, sq_cons_idx, status, out, budget),
            Cqe::ResRc {
                qp_handle,
                length,
                imm_or_inv,
                wr_idx,
                flags,
                status,
            } => self.handle_cqe_res(
                ResCqe {
                    qp_handle,
                    length,
                    imm_or_inv,
                    wr_idx,
                    flags: CqeFlags::from_bits_truncate(flags),
                    src_qp: None,
                    status,
                },
                out,
                budget,
            ),
            Cqe::ResUd {
                qp_handle,
                length,
                imm,
                wr_idx,
                flags,
                src_qp,
                status,
            } => self.handle_cqe_res(
                ResCqe {
                    qp_handle,
                    length,
                    imm_or_inv: imm,
                    wr_idx,
                    flags: CqeFlags::from_bits_truncate(flags),
                    src_qp: Some(src_qp),
                    status,
                },
                out,
                budget,
            ),
            Cqe::Terminal {
                qp_handle,
                sq_cons_idx,
                ..
            } => self.handle_cqe_terminal(qp_handle, sq_cons_idx, out, budget),
            Cqe::Cutoff { .. } => CqeAction::Cutoff,
            Cqe::Unknown { cqe_type } => {
                warn!("skipping completion of unknown type {cqe_type:#x}");
                CqeAction::Consume
            }
        }
    }

    /// A zero handle marks an entry scrubbed when its QP went away.
    fn resolve_qp(&self, raw: u64) -> Option<Arc<QpContext>> {
        let handle = Handle::from_raw(raw)?;
        let qp = self.lookup_qp(handle);
        if qp.is_none() {
            debug!("completion for stale QP handle {raw:#x}");
        }
        qp
    }

    fn handle_cqe_req(
        &self,
        qp_handle: u64,
        sq_cons_idx: u16,
        status: u8,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) -> CqeAction {
        let Some(qp) = self.resolve_qp(qp_handle) else {
            return CqeAction::Consume;
        };
        let mut inner = qp.inner.lock();
        if qp.sq_flushed.load(Ordering::Acquire) {
            return CqeAction::Consume;
        }

        let status = req_status_to_wc(status);
        match retire_sends(qp.qpn, &mut inner, u32::from(sq_cons_idx), status, out, budget) {
            SendWalk::OutOfBudget => CqeAction::Retry,
            SendWalk::Done => CqeAction::Consume,
            SendWalk::Failed => {
                warn!("QP {} send failed with {status:?}, moving to error", qp.qpn.get());
                inner.state = QpState::Error;
                self.add_flush_qp(&qp);
                CqeAction::Consume
            }
        }
    }

    fn handle_cqe_res(
        &self,
        cqe: ResCqe,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) -> CqeAction {
        let Some(qp) = self.resolve_qp(cqe.qp_handle) else {
            return CqeAction::Consume;
        };
        if *budget == 0 {
            return CqeAction::Retry;
        }
        let mut inner = qp.inner.lock();
        if qp.rq_flushed.load(Ordering::Acquire) {
            return CqeAction::Consume;
        }

        let wr_id = if cqe.flags.contains(CqeFlags::SRQ) || qp.srq.is_some() {
            let Some(srq) = &qp.srq else {
                warn!("QP {} got a shared receive completion without an SRQ", qp.qpn.get());
                return CqeAction::Consume;
            };
            let Some(wr_id) = srq.release_slot(cqe.wr_idx) else {
                warn!("SRQ {} completion for unposted tag {}", srq.id, cqe.wr_idx);
                return CqeAction::Consume;
            };
            wr_id
        } else {
            let Some(rq) = inner.rq.as_mut() else {
                return CqeAction::Consume;
            };
            if rq.oldest() != Some(cqe.wr_idx) {
                warn!(
                    "QP {} receive completion for index {} out of order, expected {:?}",
                    qp.qpn.get(),
                    cqe.wr_idx,
                    rq.oldest()
                );
                return CqeAction::Consume;
            }
            let Some(slot) = rq.retire_oldest() else {
                return CqeAction::Consume;
            };
            slot.wr_id
        };

        let status = res_status_to_wc(cqe.status);
        let mut wc = WorkCompletion::new(wr_id, status, WcOpcode::Recv, qp.qpn);
        if status == WcStatus::Success {
            wc.byte_len = cqe.length;
            if cqe.flags.contains(CqeFlags::IMM) {
                wc.imm = Some(Imm::from_be(cqe.imm_or_inv));
                wc.flags |= WcFlags::WITH_IMM;
                if cqe.flags.contains(CqeFlags::RDMA) {
                    wc.opcode = WcOpcode::RecvRdmaWithImm;
                }
            } else if cqe.flags.contains(CqeFlags::INV) {
                wc.invalidated_rkey = Some(Key::new(cqe.imm_or_inv));
                wc.flags |= WcFlags::WITH_INV;
            }
            if let Some(src_qp) = cqe.src_qp {
                wc.src_qp = Some(Qpn::new(src_qp));
                if cqe.flags.contains(CqeFlags::GRH) {
                    wc.flags |= WcFlags::GRH;
                }
                if cqe.flags.contains(CqeFlags::MULTICAST) {
                    wc.flags |= WcFlags::MULTICAST;
                }
            }
        } else if cqe.status != ResStatus::HwFlush as u8 {
            warn!("QP {} receive failed with {status:?}, moving to error", qp.qpn.get());
            inner.state = QpState::Error;
            self.add_flush_qp(&qp);
        }
        out.push(wc);
        *budget -= 1;
        CqeAction::Consume
    }

    /// The QP hit a fatal error. Sends the device finished before it still
    /// complete normally, everything else is flushed.
    fn handle_cqe_terminal(
        &self,
        qp_handle: u64,
        sq_cons_idx: u16,
        out: &mut Vec<WorkCompletion>,
        budget: &mut usize,
    ) -> CqeAction {
        let Some(qp) = self.resolve_qp(qp_handle) else {
            return CqeAction::Consume;
        };
        let mut inner = qp.inner.lock();
        inner.state = QpState::Error;
        if sq_cons_idx != CQE_CONS_IDX_NONE && !qp.sq_flushed.load(Ordering::Acquire) {
            let cons = u32::from(sq_cons_idx);
            if let SendWalk::OutOfBudget =
                retire_sends(qp.qpn, &mut inner, cons, WcStatus::Success, out, budget)
            {
                return CqeAction::Retry;
            }
        }
        warn!("QP {} received terminal completion", qp.qpn.get());
        self.add_flush_qp(&qp);
        CqeAction::Consume
    }
}
