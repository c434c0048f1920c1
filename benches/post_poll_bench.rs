use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use roce_datapath::{
    device::{EmulatedDevice, ReqStatus},
    Config, Context, Key, QpInitAttr, QpState, QpType, SendOp, SendWr, Sge, WorkCompletion,
};

fn setup(depth: u32) -> (EmulatedDevice, Context, roce_datapath::Cq, roce_datapath::Qp) {
    let dev = EmulatedDevice::new();
    let ctx = Context::new(dev.clone(), Config::default()).unwrap();
    let cq = ctx.create_cq(depth * 2).unwrap();
    let mut attr = QpInitAttr::new(QpType::Rc, cq, cq);
    attr.max_send_wr = depth;
    let qp = ctx.create_qp(&attr).unwrap();
    for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
        ctx.modify_qp(&qp, state).unwrap();
    }
    (dev, ctx, cq, qp)
}

fn batch(len: usize) -> Vec<SendWr> {
    (0..len as u64)
        .map(|wr_id| {
            SendWr::new(
                wr_id,
                SendOp::Send,
                vec![Sge {
                    addr: 0x1000,
                    len: 64,
                    key: Key::new(1),
                }],
            )
        })
        .collect()
}

fn criterion_post_poll_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_poll");
    for batch_len in [1usize, 16, 32] {
        let (dev, ctx, cq, qp) = setup(64);
        let wrs = batch(batch_len);
        let mut wcs: Vec<WorkCompletion> = Vec::with_capacity(batch_len);
        group.bench_function(BenchmarkId::new("round_trip", batch_len), |b| {
            b.iter(|| {
                ctx.post_send(&qp, black_box(&wrs)).unwrap();
                dev.complete_sends(qp.qpn().get(), batch_len, ReqStatus::Ok)
                    .unwrap();
                wcs.clear();
                let n = ctx.poll_cq(&cq, &mut wcs, batch_len).unwrap();
                assert_eq!(n, batch_len);
                dev.clear_doorbells();
            })
        });
    }
    group.finish();
}

fn criterion_empty_poll_benchmark(c: &mut Criterion) {
    let (_dev, ctx, cq, _qp) = setup(64);
    let mut wcs = Vec::with_capacity(16);
    c.bench_function("empty_poll", |b| {
        b.iter(|| {
            wcs.clear();
            black_box(ctx.poll_cq(&cq, &mut wcs, 16).unwrap())
        })
    });
}

criterion_group!(
    benches,
    criterion_post_poll_benchmark,
    criterion_empty_poll_benchmark
);
criterion_main!(benches);
