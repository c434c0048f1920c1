use roce_datapath::{
    device::{DeviceAttr, EmulatedDevice},
    Config, Context, Error, QpInitAttr, QpType, SrqInitAttr,
};

mod common;

#[test]
fn device_init() {
    let dev = EmulatedDevice::new();
    let ctx = Context::new(dev.clone(), Config::default()).unwrap();
    let cq = ctx.create_cq(16).unwrap();
    let qp = ctx.create_qp(&QpInitAttr::new(QpType::Rc, cq, cq)).unwrap();

    assert!(matches!(ctx.destroy_cq(cq), Err(Error::CqInUse)));
    ctx.destroy_qp(qp).unwrap();
    ctx.destroy_cq(cq).unwrap();
}

#[test]
fn control_failure_leaves_no_queue() {
    let (dev, ctx) = common::context();
    let cq = ctx.create_cq(16).unwrap();
    dev.fail_next_control();
    assert!(matches!(
        ctx.create_qp(&QpInitAttr::new(QpType::Rc, cq, cq)),
        Err(Error::Device(_))
    ));
    // nothing holds the CQ
    ctx.destroy_cq(cq).unwrap();
}

#[test]
fn rejects_zero_depth() {
    let (_dev, ctx) = common::context();
    assert!(matches!(ctx.create_cq(0), Err(Error::InvalidDepth(0))));
    let cq = ctx.create_cq(4).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.max_send_wr = 0;
    assert!(matches!(ctx.create_qp(&attr), Err(Error::InvalidDepth(0))));
}

#[test]
fn rejects_oversized_depth() {
    let (_dev, ctx) = common::context();
    let cq = ctx.create_cq(4).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.max_send_wr = 0x2000_0001;
    assert!(matches!(
        ctx.create_qp(&attr),
        Err(Error::InvalidDepth(0x2000_0001))
    ));
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.max_recv_wr = 0x1_0000;
    assert!(matches!(
        ctx.create_qp(&attr),
        Err(Error::InvalidDepth(0x1_0000))
    ));
    let srq = SrqInitAttr {
        max_wr: 0x1_0000,
        ..SrqInitAttr::default()
    };
    assert!(matches!(ctx.create_srq(&srq), Err(Error::InvalidDepth(0x1_0000))));
}

#[test]
fn ring_size_overflow_is_rejected() {
    let attr = DeviceAttr {
        max_qp_wr: u32::MAX,
        ..DeviceAttr::default()
    };
    let (_dev, ctx) = common::context_with(EmulatedDevice::with_attr(attr), Config::default());
    let cq = ctx.create_cq(4).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.max_send_wr = 0x2000_0001;
    assert!(matches!(
        ctx.create_qp(&attr),
        Err(Error::InvalidDepth(0x2000_0001))
    ));
    // nothing holds the CQ
    ctx.destroy_cq(cq).unwrap();
}
