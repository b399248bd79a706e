use std::convert::Infallible;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strand_runtime::{Effect, Mailbox, Runtime, RuntimeConfig, Stm, TRef};

fn runtime(workers: usize) -> Runtime {
    Runtime::with_config(RuntimeConfig {
        workers,
        ..RuntimeConfig::default()
    })
    .expect("runtime")
}

fn flat_map_chain(n: u64) -> Effect<u64> {
    (0..n).fold(Effect::succeed(0), |acc, _| acc.flat_map(|x| Effect::succeed(x + 1)))
}

fn effect_benchmark(c: &mut Criterion) {
    let rt = runtime(1);
    let mut group = c.benchmark_group("effect");

    for depth in [100u64, 1_000, 10_000] {
        let chain = flat_map_chain(depth);
        group.bench_with_input(BenchmarkId::new("flat_map_chain", depth), &chain, |b, chain| {
            b.iter(|| black_box(rt.run(chain.clone())))
        });
    }

    let forks: Effect<Vec<u64>> = Effect::collect_all_par((0..64u64).map(Effect::succeed));
    group.bench_function("collect_all_par_64", |b| {
        b.iter(|| black_box(rt.run(forks.clone())))
    });
    group.finish();
}

fn sync_benchmark(c: &mut Criterion) {
    let rt = runtime(2);
    let mut group = c.benchmark_group("sync");

    let counter = TRef::new(0u64);
    let bump: Stm<()> = counter.update(|n| n + 1);
    let commits: Effect<Vec<()>> = Effect::for_each(0..1_000, move |_: u32| bump.commit());
    group.bench_function("stm_commit_1000", |b| {
        b.iter(|| black_box(rt.run(commits.clone())))
    });

    group.bench_function("mailbox_ping_1000", |b| {
        b.iter(|| {
            let mailbox: Mailbox<u32> = Mailbox::bounded(16);
            let tx = mailbox.clone();
            let producer = Effect::for_each(0..1_000u32, move |n| tx.offer::<Infallible>(n));
            let rx = mailbox.clone();
            let consumer = Effect::for_each(0..1_000u32, move |_| rx.take());
            black_box(rt.run(producer.zip_par(consumer)))
        })
    });
    group.finish();
}

criterion_group!(benches, effect_benchmark, sync_benchmark);
criterion_main!(benches);
