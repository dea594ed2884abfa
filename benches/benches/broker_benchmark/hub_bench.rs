use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mercury::{Handler, MessageHub, PublishContext, Subscription};
use tokio::runtime::Runtime;

#[derive(Debug)]
struct Event(u32);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn noop() -> Handler<Event> {
    Handler::sync(|event: &Event| {
        black_box(event.0);
        Ok(())
    })
}

fn hub_publish_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("hub_publish");

    for scopes in [1u32, 16, 256] {
        let hub = MessageHub::default();
        let _subs: Vec<Subscription> = (0..scopes)
            .map(|scope| hub.subscribe_scoped(scope, noop(), 0))
            .collect();
        let ctx = PublishContext::new();

        group.bench_with_input(BenchmarkId::new("registry", scopes), &scopes, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(hub.publish_scoped(0u32, Event(1), &ctx).await)
            })
        });
    }

    group.finish();
}

fn cached_publish_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let hub = MessageHub::default();
    let _sub = hub.subscribe_scoped(7u32, noop(), 0);
    let publisher = hub.cache_scoped::<u32, Event>(7);
    let ctx = PublishContext::new();

    c.bench_function("hub_cached_publish", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(publisher.publish(Event(1), &ctx).await) })
    });
}

fn scope_churn_benchmark(c: &mut Criterion) {
    let hub = MessageHub::default();

    c.bench_function("hub_scope_create_evict", |b| {
        let mut scope = 0u32;
        b.iter(|| {
            scope = scope.wrapping_add(1);
            let sub = hub.subscribe_scoped(scope, noop(), 0);
            drop(black_box(sub));
        })
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(500))
        .measurement_time(std::time::Duration::from_secs(2));
    targets =
        hub_publish_benchmark,
        cached_publish_benchmark,
        scope_churn_benchmark
);
criterion_main!(benches);
