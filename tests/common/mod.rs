#![allow(dead_code)]

use roce_datapath::{
    device::EmulatedDevice, Config, Context, Cq, Key, Qp, QpInitAttr, QpState, QpType, RecvWr,
    SendOp, SendWr, Sge, WorkCompletion,
};

pub fn context() -> (EmulatedDevice, Context) {
    context_with(EmulatedDevice::new(), Config::default())
}

pub fn context_with(dev: EmulatedDevice, config: Config) -> (EmulatedDevice, Context) {
    let ctx = Context::new(dev.clone(), config).unwrap();
    (dev, ctx)
}

pub fn sge(len: u32) -> Sge {
    Sge {
        addr: 0x1000,
        len,
        key: Key::new(0x42),
    }
}

pub fn send(wr_id: u64, len: u32) -> SendWr {
    SendWr::new(wr_id, SendOp::Send, vec![sge(len)])
}

pub fn recv(wr_id: u64) -> RecvWr {
    RecvWr::new(wr_id, vec![sge(4096)])
}

/// Walk the QP up to ready-to-send.
pub fn ready(ctx: &Context, qp: &Qp) {
    for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
        ctx.modify_qp(qp, state).unwrap();
    }
}

pub fn qp(ctx: &Context, qp_type: QpType, cq: Cq) -> Qp {
    qp_with(ctx, QpInitAttr::new(qp_type, cq, cq))
}

pub fn qp_with(ctx: &Context, attr: QpInitAttr) -> Qp {
    let qp = ctx.create_qp(&attr).unwrap();
    ready(ctx, &qp);
    qp
}

pub fn poll(ctx: &Context, cq: &Cq, max: usize) -> Vec<WorkCompletion> {
    let mut wcs = Vec::new();
    ctx.poll_cq(cq, &mut wcs, max).unwrap();
    wcs
}
