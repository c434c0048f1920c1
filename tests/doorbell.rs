use roce_datapath::{
    device::{db_type, ChipGen, DeviceAttr, EmulatedDevice, ReqStatus},
    Config, QpType,
};
use std::{
    sync::atomic::Ordering,
    thread,
    time::{Duration, Instant},
};

mod common;
use common::{poll, recv, send};

fn wait_for_acks(dev: &EmulatedDevice, count: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while dev.acked_events() < count {
        assert!(Instant::now() < deadline, "recovery never acknowledged");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn drop_replays_last_doorbells() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    ctx.post_send(&qp, &[send(1, 8), send(2, 8)]).unwrap();
    ctx.post_recv(&qp, &[recv(3)]).unwrap();

    let before = dev.doorbells();
    let last_of = |ty: u32| {
        before
            .iter()
            .rev()
            .find(|db| db.key.db_type() == ty)
            .map(|db| db.key)
            .unwrap()
    };
    let (sq, rq, cq_arm) = (
        last_of(db_type::SQ),
        last_of(db_type::RQ),
        last_of(db_type::CQ_ARMENA),
    );

    dev.clear_doorbells();
    dev.signal_doorbell_drop();
    wait_for_acks(&dev, 1);

    let replayed: Vec<_> = dev.doorbells().iter().map(|db| db.key).collect();
    assert_eq!(replayed.len(), 3);
    for key in [sq, rq, cq_arm] {
        assert!(replayed.contains(&key), "{key:?} not replayed");
    }
    let page = dev.recovery().unwrap();
    assert_eq!(
        page.epoch_ack.load(Ordering::Acquire),
        page.epoch.load(Ordering::Acquire)
    );
    // replaying a known producer index fetches nothing twice
    assert_eq!(dev.posted_sends(qp.qpn().get()).len(), 2);
}

#[test]
fn destroyed_queues_are_not_replayed() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    ctx.post_send(&qp, &[send(1, 8)]).unwrap();
    ctx.destroy_qp(qp).unwrap();

    dev.clear_doorbells();
    dev.signal_doorbell_drop();
    wait_for_acks(&dev, 1);
    let types: Vec<_> = dev.doorbells().iter().map(|db| db.key.db_type()).collect();
    assert_eq!(types, [db_type::CQ_ARMENA]);
}

#[test]
fn recovery_can_be_disabled() {
    let config = Config {
        drop_recovery: false,
        ..Config::default()
    };
    let (dev, ctx) = common::context_with(EmulatedDevice::new(), config);
    let _cq = ctx.create_cq(16).unwrap();
    dev.clear_doorbells();
    dev.signal_doorbell_drop();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(dev.acked_events(), 0);
    assert!(dev.doorbells().is_empty());
}

#[test]
fn error_state_drops_doorbells() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    let qpn = qp.qpn().get();
    dev.clear_doorbells();

    dev.pacing().dev_err_state.store(1, Ordering::Release);
    ctx.post_send(&qp, &[send(1, 8)]).unwrap();
    assert!(dev.doorbells().is_empty());
    assert!(dev.posted_sends(qpn).is_empty());

    dev.pacing().dev_err_state.store(0, Ordering::Release);
    ctx.post_send(&qp, &[send(2, 8)]).unwrap();
    let dbs = dev.doorbells();
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0].key.index(), 16);
    // the later producer index covers the dropped one
    assert_eq!(dev.posted_sends(qpn).len(), 2);

    dev.complete_sends(qpn, 2, ReqStatus::Ok).unwrap();
    assert_eq!(poll(&ctx, &cq, 16).len(), 2);
}

#[test]
fn congestion_drains_sentinel_cq() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    let pacing = dev.pacing();
    pacing.pacing_th.store(10, Ordering::Relaxed);
    pacing.alarm_th.store(20, Ordering::Relaxed);
    pacing.do_pacing.store(0xffff, Ordering::Relaxed);
    dev.script_fifo_occupancy([30, 15, 5]);
    dev.clear_doorbells();

    ctx.post_send(&qp, &[send(1, 8)]).unwrap();
    assert_eq!(dev.kernel_polls(), 1);
    assert_eq!(dev.doorbells().len(), 1);
}

#[test]
fn push_replaces_send_doorbell() {
    let attr = DeviceAttr {
        push: true,
        ..DeviceAttr::default()
    };
    let config = Config {
        push: true,
        ..Config::default()
    };
    let (dev, ctx) = common::context_with(EmulatedDevice::with_attr(attr), config);
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    dev.clear_doorbells();

    ctx.post_send(&qp, &[send(1, 8)]).unwrap();
    let types: Vec<_> = dev.doorbells().iter().map(|db| db.key.db_type()).collect();
    assert_eq!(types, [db_type::PUSH_START, db_type::PUSH_END]);
    let pushes = dev.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, 0);
    assert_eq!(dev.posted_sends(qp.qpn().get()).len(), 1);
}

#[test]
fn early_stepping_adds_send_doorbell_after_push() {
    let attr = DeviceAttr {
        push: true,
        early_stepping: true,
        chip_gen: ChipGen::P7,
        ..DeviceAttr::default()
    };
    let config = Config {
        push: true,
        ..Config::default()
    };
    let (dev, ctx) = common::context_with(EmulatedDevice::with_attr(attr), config);
    let cq = ctx.create_cq(16).unwrap();
    let a = common::qp(&ctx, QpType::Rc, cq);
    let b = common::qp(&ctx, QpType::Rc, cq);
    dev.clear_doorbells();

    ctx.post_send(&b, &[send(1, 8)]).unwrap();
    let types: Vec<_> = dev.doorbells().iter().map(|db| db.key.db_type()).collect();
    assert_eq!(
        types,
        [db_type::PUSH_START, db_type::PUSH_END, db_type::SQ]
    );
    // each QP holds its own buffer
    assert_eq!(dev.pushes()[0].0, 1);

    ctx.destroy_qp(a).unwrap();
    let c = common::qp(&ctx, QpType::Rc, cq);
    dev.clear_doorbells();
    ctx.post_send(&c, &[send(2, 8)]).unwrap();
    assert_eq!(dev.pushes().last().map(|p| p.0), Some(0));
}
