use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mercury::{Broker, Handler, PublishContext, Subscription};
use tokio::runtime::Runtime;

#[derive(Debug)]
struct Tick(u64);

fn noop() -> Handler<Tick> {
    Handler::sync(|tick: &Tick| {
        black_box(tick.0);
        Ok(())
    })
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn subscribe_benchmark(c: &mut Criterion) {
    let broker: Broker<Tick> = Broker::new();

    c.bench_function("broker_subscribe_dispose", |b| {
        b.iter(|| {
            let sub = broker.subscribe(noop(), black_box(0));
            sub.dispose();
        })
    });

    c.bench_function("broker_compress_empty_groups", |b| {
        b.iter(|| {
            for order in 0..16 {
                broker.subscribe(noop(), order).dispose();
            }
            black_box(broker.compress())
        })
    });
}

fn publish_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("broker_publish");

    for handlers in [0usize, 1, 10, 100] {
        let broker: Broker<Tick> = Broker::new();
        let _subs: Vec<Subscription> = (0..handlers).map(|_| broker.subscribe(noop(), 0)).collect();
        let ctx = PublishContext::new();

        group.throughput(Throughput::Elements(handlers.max(1) as u64));
        group.bench_with_input(
            BenchmarkId::new("single_group", handlers),
            &handlers,
            |b, _| {
                b.to_async(&rt)
                    .iter(|| async { black_box(broker.publish(Tick(1), &ctx).await) })
            },
        );
    }

    for groups in [2i32, 8, 32] {
        let broker: Broker<Tick> = Broker::new();
        let _subs: Vec<Subscription> = (0..groups).map(|order| broker.subscribe(noop(), order)).collect();
        let ctx = PublishContext::new();

        group.bench_with_input(
            BenchmarkId::new("priority_groups", groups),
            &groups,
            |b, _| {
                b.to_async(&rt)
                    .iter(|| async { black_box(broker.publish(Tick(1), &ctx).await) })
            },
        );
    }

    group.finish();
}

fn async_handler_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let broker: Broker<Tick> = Broker::new();
    let _subs: Vec<Subscription> = (0..10)
        .map(|_| {
            broker.subscribe(
                Handler::message(|tick: std::sync::Arc<Tick>| async move {
                    tokio::task::yield_now().await;
                    black_box(tick.0);
                    anyhow::Ok(())
                }),
                0,
            )
        })
        .collect();
    let ctx = PublishContext::new();

    c.bench_function("broker_publish_yielding_handlers", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(broker.publish(Tick(1), &ctx).await) })
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(500))
        .measurement_time(std::time::Duration::from_secs(2));
    targets =
        subscribe_benchmark,
        publish_benchmark,
        async_handler_benchmark
);
criterion_main!(benches);
