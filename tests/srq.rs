use roce_datapath::{
    device::{db_type, RecvCompletion},
    Error, QpInitAttr, QpType, SrqInitAttr,
};

mod common;
use common::{poll, recv};

fn srq_attr(max_wr: u32, limit: u32) -> SrqInitAttr {
    SrqInitAttr {
        max_wr,
        max_sge: 1,
        limit,
    }
}

#[test]
fn completes_out_of_order() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(64).unwrap();
    let srq = ctx.create_srq(&srq_attr(8, 0)).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.srq = Some(srq);
    let qp = common::qp_with(&ctx, attr);
    let qpn = qp.qpn().get();

    ctx.post_srq_recv(&srq, &[recv(1), recv(2), recv(3)]).unwrap();
    assert_eq!(dev.posted_srq_recvs(srq.id()).len(), 3);
    assert_eq!(ctx.srq_available(&srq).unwrap(), 5);

    dev.complete_recv_nth(qpn, 2, RecvCompletion::success(10)).unwrap();
    dev.complete_recv(qpn, RecvCompletion::success(20)).unwrap();
    let wcs = poll(&ctx, &cq, 16);
    let got: Vec<_> = wcs.iter().map(|wc| (wc.wr_id, wc.byte_len)).collect();
    assert_eq!(got, [(3, 10), (1, 20)]);
    assert_eq!(ctx.srq_available(&srq).unwrap(), 7);

    // released tags go back into circulation
    let wrs: Vec<_> = (10..17).map(recv).collect();
    ctx.post_srq_recv(&srq, &wrs).unwrap();
    assert_eq!(ctx.srq_available(&srq).unwrap(), 0);
    let err = ctx.post_srq_recv(&srq, &[recv(99)]).unwrap_err();
    assert!(matches!(err.source, Error::QueueFull));
}

#[test]
fn qp_on_srq_rejects_own_receives() {
    let (_dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let srq = ctx.create_srq(&srq_attr(4, 0)).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.srq = Some(srq);
    let qp = common::qp_with(&ctx, attr);

    let err = ctx.post_recv(&qp, &[recv(1)]).unwrap_err();
    assert!(matches!(err.source, Error::QpUsesSrq));

    assert!(matches!(ctx.destroy_srq(srq), Err(Error::SrqInUse)));
    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_srq(srq).unwrap();
}

#[test]
fn srq_flush_leaves_shared_receives() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let srq = ctx.create_srq(&srq_attr(4, 0)).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.srq = Some(srq);
    let qp = common::qp_with(&ctx, attr);

    ctx.post_srq_recv(&srq, &[recv(1)]).unwrap();
    ctx.post_send(&qp, &[common::send(2, 8)]).unwrap();
    ctx.modify_qp(&qp, roce_datapath::QpState::Error).unwrap();

    let wcs = poll(&ctx, &cq, 16);
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].wr_id, 2);
    assert_eq!(ctx.srq_available(&srq).unwrap(), 3);
    assert_eq!(dev.posted_srq_recvs(srq.id()).len(), 1);
}

#[test]
fn limit_enables_arm_at_create() {
    let (dev, ctx) = common::context();
    dev.clear_doorbells();
    let _quiet = ctx.create_srq(&srq_attr(4, 0)).unwrap();
    assert!(dev.doorbells().is_empty());

    let srq = ctx.create_srq(&srq_attr(4, 2)).unwrap();
    let dbs = dev.doorbells();
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0].key.db_type(), db_type::SRQ_ARMENA);
    assert_eq!(dbs[0].key.xid(), srq.id());
}

#[test]
fn arm_waits_for_threshold() {
    let (dev, ctx) = common::context();
    let srq = ctx.create_srq(&srq_attr(8, 0)).unwrap();
    dev.clear_doorbells();

    ctx.arm_srq(&srq, 3).unwrap();
    assert!(dev.doorbells().is_empty());

    ctx.post_srq_recv(&srq, &[recv(1), recv(2)]).unwrap();
    let arms = |dev: &roce_datapath::device::EmulatedDevice| {
        dev.doorbells()
            .into_iter()
            .filter(|db| db.key.db_type() == db_type::SRQ_ARM)
            .collect::<Vec<_>>()
    };
    assert!(arms(&dev).is_empty());

    ctx.post_srq_recv(&srq, &[recv(3), recv(4), recv(5)]).unwrap();
    let fired = arms(&dev);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].key.index(), 3);

    // one arm per request
    ctx.post_srq_recv(&srq, &[recv(6)]).unwrap();
    assert_eq!(arms(&dev).len(), 1);
}

#[test]
fn arm_below_threshold_fires_now() {
    let (dev, ctx) = common::context();
    let srq = ctx.create_srq(&srq_attr(4, 0)).unwrap();
    ctx.post_srq_recv(&srq, &[recv(1), recv(2), recv(3)]).unwrap();
    dev.clear_doorbells();

    ctx.arm_srq(&srq, 2).unwrap();
    let dbs = dev.doorbells();
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0].key.db_type(), db_type::SRQ_ARM);
    assert_eq!(dbs[0].key.index(), 2);
}
