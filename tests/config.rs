use roce_datapath::{
    device::{db_type, EmulatedDevice},
    Config, QpType, WqeMode,
};
use serial_test::serial;
use std::env;

mod common;
use common::send;

#[test]
#[serial]
fn variable_mode_from_environment() {
    env::set_var("DATAPATH_WQE_MODE", "variable");
    let config = Config::from_env().unwrap();
    env::remove_var("DATAPATH_WQE_MODE");
    assert_eq!(config.wqe_mode, WqeMode::Variable);

    let (dev, ctx) = common::context_with(EmulatedDevice::new(), config);
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    dev.clear_doorbells();

    ctx.post_send(&qp, &[send(1, 8), send(2, 8)]).unwrap();
    let db = dev
        .doorbells()
        .into_iter()
        .find(|db| db.key.db_type() == db_type::SQ)
        .unwrap();
    // header plus one SGE slot each
    assert_eq!(db.key.index(), 6);
}

#[test]
#[serial]
fn single_threaded_from_environment() {
    env::set_var("DATAPATH_SINGLE_THREADED", "yes");
    env::set_var("DATAPATH_DBR_RECOVERY", "off");
    let config = Config::from_env().unwrap();
    env::remove_var("DATAPATH_SINGLE_THREADED");
    env::remove_var("DATAPATH_DBR_RECOVERY");
    assert!(config.single_threaded);
    assert!(!config.drop_recovery);

    let (dev, ctx) = common::context_with(EmulatedDevice::new(), config);
    let cq = ctx.create_cq(16).unwrap();
    let qp = common::qp(&ctx, QpType::Rc, cq);
    ctx.post_send(&qp, &[send(1, 8)]).unwrap();
    dev.complete_sends(qp.qpn().get(), 1, roce_datapath::device::ReqStatus::Ok)
        .unwrap();
    assert_eq!(common::poll(&ctx, &cq, 4).len(), 1);
}

#[test]
#[serial]
fn json_config() {
    let config = Config::from_json(r#"{"max_inline": 32, "push": true}"#).unwrap();
    assert_eq!(config.max_inline, 32);
    assert!(config.push);
    assert_eq!(config.wqe_mode, WqeMode::Static);
}
