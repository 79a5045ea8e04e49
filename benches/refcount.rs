//! Reference counting and dispatch benchmarks
//!
//! Measures the hot paths: strong clone/drop, weak promotion, light counting,
//! and a full round trip through the loopback transport.

use bindery::{
    Binder, BinderObject, CallerInfo, IpcError, LightHooks, LightRc, LoopbackDriver, Payload,
    Process, ProcessConfig, RefHooks, Sp, FIRST_CALL_TRANSACTION,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

struct Plain(u64);

impl RefHooks for Plain {}
impl LightHooks for Plain {}

struct Echo;

impl Binder for Echo {
    fn descriptor(&self) -> &str {
        "bench.Echo"
    }

    fn on_transact(
        &self,
        _code: u32,
        data: &Payload,
        reply: &mut Payload,
        _caller: &CallerInfo,
    ) -> Result<(), IpcError> {
        reply.write_bytes(data.data());
        Ok(())
    }
}

fn bench_strong(c: &mut Criterion) {
    let mut group = c.benchmark_group("strong");

    let sp = Sp::new(Plain(7));
    group.bench_function("clone_drop", |b| {
        b.iter(|| {
            let extra = black_box(sp.clone());
            drop(extra);
        })
    });

    let wp = Sp::downgrade(&sp);
    group.bench_function("promote", |b| {
        b.iter(|| {
            let promoted = black_box(wp.promote());
            drop(promoted);
        })
    });

    let light = LightRc::new(Plain(7));
    group.bench_function("light_clone_drop", |b| {
        b.iter(|| {
            let extra = black_box(light.clone());
            drop(extra);
        })
    });

    group.bench_function("new_drop", |b| {
        b.iter(|| drop(black_box(Sp::new(Plain(1)))))
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    let driver = LoopbackDriver::new();
    let server = Process::new(ProcessConfig::default(), driver.connect(1, 0)).unwrap();
    server.become_context_manager().unwrap();
    server.set_context_object("echo", BinderObject::local(Echo));
    server.start_thread_pool().unwrap();

    let client = Process::new(ProcessConfig::default(), driver.connect(2, 0)).unwrap();
    let echo = client.lookup_context_object("echo").unwrap();

    for size in [0usize, 64, 4096] {
        let request = Payload::from_bytes(vec![0xa5; size]);
        group.bench_with_input(BenchmarkId::new("echo", size), &request, |b, request| {
            b.iter(|| {
                let reply = echo.transact(FIRST_CALL_TRANSACTION, request, 0).unwrap();
                black_box(reply.len())
            })
        });
    }

    group.finish();
    drop(echo);
    client.release_current_thread();
    client.shutdown();
    server.release_current_thread();
    server.shutdown();
}

criterion_group!(benches, bench_strong, bench_round_trip);
criterion_main!(benches);
