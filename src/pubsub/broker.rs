use std::{
    any::{type_name, Any},
    cmp::Ordering as CmpOrdering,
    fmt, mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{future::join_all, FutureExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    group::HandlerGroup,
    pool::{GroupBound, InFlight, Pooled, SnapshotPools},
    subscription::DisposeHook,
    DeliveryReport, Diagnostics, Handler, PublishContext, Subscription, TracingDiagnostics,
};
use crate::error::BrokerError;

/// Направление обхода групп при публикации.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Меньший порядок запускается раньше.
    #[default]
    Ascending,
    /// Больший порядок запускается раньше.
    Descending,
}

/// Брокер сообщений одного типа.
///
/// Хранит группы обработчиков, упорядоченные по приоритету. Публикация
/// запускает группы последовательно, а обработчики внутри группы
/// конкурентно, дожидаясь завершения всей группы перед переходом к следующей.
///
/// `Broker` можно дёшево клонировать: все клоны разделяют состояние.
pub struct Broker<M> {
    inner: Arc<BrokerInner<M>>,
}

struct BrokerInner<M> {
    state: Mutex<BrokerState<M>>,
    ref_count: AtomicIsize,
    disposed: AtomicBool,
    snapshot_hint: AtomicUsize,
    priority: PriorityOrder,
    pools: Arc<SnapshotPools<M>>,
    diagnostics: Arc<dyn Diagnostics>,
}

struct BrokerState<M> {
    /// Упорядоченный список существующих порядков.
    orders: Vec<i32>,
    groups: FxHashMap<i32, Arc<HandlerGroup<M>>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl PriorityOrder {
    /// Сравнивает порядки в направлении выполнения групп.
    pub fn compare(
        self,
        a: i32,
        b: i32,
    ) -> CmpOrdering {
        match self {
            Self::Ascending => a.cmp(&b),
            Self::Descending => b.cmp(&a),
        }
    }
}

impl<M> BrokerState<M> {
    fn new() -> Self {
        Self {
            orders: Vec::new(),
            groups: FxHashMap::default(),
        }
    }
}

impl<M: Send + Sync + 'static> BrokerState<M> {
    /// Возвращает группу `order`, создавая её и вставляя порядок в
    /// отсортированную позицию.
    fn group_or_insert(
        &mut self,
        order: i32,
        priority: PriorityOrder,
    ) -> Arc<HandlerGroup<M>> {
        if let Some(group) = self.groups.get(&order) {
            return Arc::clone(group);
        }

        let pos = self
            .orders
            .binary_search_by(|existing| priority.compare(*existing, order))
            .unwrap_or_else(|pos| pos);
        self.orders.insert(pos, order);

        let group = Arc::new(HandlerGroup::new(order));
        self.groups.insert(order, Arc::clone(&group));
        group
    }
}

impl<M: Send + Sync + 'static> Broker<M> {
    /// Брокер с порядком по возрастанию и диагностикой через `tracing`.
    pub fn new() -> Self {
        Self::with_config(
            PriorityOrder::default(),
            Arc::new(SnapshotPools::default()),
            Arc::new(TracingDiagnostics),
        )
    }

    pub fn with_config(
        priority: PriorityOrder,
        pools: Arc<SnapshotPools<M>>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new()),
                ref_count: AtomicIsize::new(0),
                disposed: AtomicBool::new(false),
                snapshot_hint: AtomicUsize::new(0),
                priority,
                pools,
                diagnostics,
            }),
        }
    }

    /// Регистрирует обработчик с порядком `order`.
    ///
    /// Если такой обработчик уже есть в группе `order` или брокер
    /// освобождён, ошибка уходит в диагностику и возвращается пустой
    /// дескриптор.
    pub fn subscribe(
        &self,
        handler: Handler<M>,
        order: i32,
    ) -> Subscription {
        self.subscribe_with_hook(handler, order, None)
    }

    pub(crate) fn subscribe_with_hook(
        &self,
        handler: Handler<M>,
        order: i32,
        on_dispose: Option<DisposeHook>,
    ) -> Subscription {
        self.try_subscribe_with_hook(handler, order, on_dispose)
            .unwrap_or_else(|err| {
                self.report(&err);
                Subscription::empty()
            })
    }

    /// Регистрирует обработчик, не сообщая об отказе в диагностику. Ошибку
    /// сообщает вызывающий, уже отпустив свои блокировки.
    pub(crate) fn try_subscribe_with_hook(
        &self,
        handler: Handler<M>,
        order: i32,
        on_dispose: Option<DisposeHook>,
    ) -> Result<Subscription, BrokerError> {
        let handler = Arc::new(handler);
        let id = handler.id();

        let group = {
            let mut state = self.inner.state.lock();
            // Проверка под блокировкой: `dispose` очищает состояние под ней же.
            if self.is_disposed() {
                None
            } else {
                let group = state.group_or_insert(order, self.inner.priority);
                group.try_add(Arc::clone(&handler)).then_some(group)
            }
        };

        match group {
            Some(group) => {
                trace!(
                    handler = %id,
                    order,
                    message_type = type_name::<M>(),
                    "Handler subscribed"
                );
                Ok(Subscription::new(
                    handler,
                    Arc::downgrade(&group),
                    on_dispose,
                ))
            }
            None if self.is_disposed() => Err(BrokerError::Disposed {
                message_type: type_name::<M>(),
            }),
            None => Err(BrokerError::DuplicateHandler {
                handler: id,
                order,
                message_type: type_name::<M>(),
            }),
        }
    }

    /// Удаляет пустые группы и их порядки. Возвращает число удалённых групп.
    pub fn compress(&self) -> usize {
        let removed: Vec<Arc<HandlerGroup<M>>> = {
            let mut state = self.inner.state.lock();
            let BrokerState { orders, groups } = &mut *state;

            let mut removed = Vec::new();
            orders.retain(|order| {
                let empty = groups.get(order).map_or(true, |g| g.is_empty());
                if empty {
                    removed.extend(groups.remove(order));
                }
                !empty
            });
            removed
        };

        for group in &removed {
            group.dispose();
        }
        if !removed.is_empty() {
            trace!(
                groups = removed.len(),
                message_type = type_name::<M>(),
                "Broker compressed"
            );
        }
        removed.len()
    }

    /// Публикует сообщение.
    ///
    /// Группы запускаются в порядке приоритета; обработчики группы
    /// конкурентно. Ошибки и паники обработчиков передаются в диагностику и
    /// не прерывают доставку. Отмена проверяется перед запуском первой
    /// группы и после завершения каждой.
    pub async fn publish(
        &self,
        message: impl Into<Arc<M>>,
        context: &PublishContext,
    ) -> DeliveryReport {
        let message: Arc<M> = message.into();
        let mut report = DeliveryReport::default();

        if context.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let (handlers, bounds) = self.snapshot();
        if bounds.is_empty() {
            return report;
        }

        let diagnostics = Arc::clone(
            context
                .diagnostics()
                .unwrap_or(&self.inner.diagnostics),
        );
        let widest = widest_group(&bounds);
        let mut inflight = self.inner.pools.inflight.rent(widest);

        let mut start = 0;
        for (index, bound) in bounds.iter().enumerate() {
            if context.is_cancelled() {
                report.cancelled = true;
                break;
            }

            report.groups += 1;
            for handler in &handlers[start..bound.end] {
                match catch_unwind(AssertUnwindSafe(|| handler.invoke(&message, context))) {
                    Ok(Some(future)) => {
                        report.invoked += 1;
                        inflight.push(InFlight {
                            handler: handler.id(),
                            future,
                        });
                    }
                    Ok(None) => {}
                    Err(payload) => {
                        report.invoked += 1;
                        report.failed += 1;
                        diagnostics.report(&BrokerError::HandlerPanicked {
                            handler: handler.id(),
                            order: bound.order,
                            message_type: type_name::<M>(),
                            reason: panic_reason(payload.as_ref()),
                        });
                    }
                }
            }
            start = bound.end;

            report.failed +=
                join_group::<M>(inflight.drain(..), bound.order, &*diagnostics).await;

            let more = index + 1 < bounds.len();
            if more && context.is_cancelled() {
                report.cancelled = true;
                break;
            }
        }

        report
    }

    /// Снимок обработчиков под блокировкой брокера. Группы в снимке идут в
    /// порядке приоритета, пустые группы пропускаются.
    fn snapshot(&self) -> (Pooled<Arc<Handler<M>>>, Pooled<GroupBound>) {
        let pools = &self.inner.pools;
        let state = self.inner.state.lock();

        let hint = self.inner.snapshot_hint.load(Ordering::Relaxed);
        let mut handlers = pools.handlers.rent(hint);
        let mut bounds = pools.bounds.rent(state.orders.len());

        for order in &state.orders {
            let Some(group) = state.groups.get(order) else {
                continue;
            };
            let before = handlers.len();
            group.snapshot_into(&mut handlers);
            if handlers.len() > before {
                bounds.push(GroupBound {
                    order: *order,
                    end: handlers.len(),
                });
            }
        }
        drop(state);

        self.inner
            .snapshot_hint
            .store(handlers.len(), Ordering::Relaxed);
        (handlers, bounds)
    }

    /// Список порядков пуст. Опустевшие, но ещё не уплотнённые группы
    /// учитываются: брокер становится пустым только после [`Broker::compress`].
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().orders.is_empty()
    }

    pub fn handler_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.groups.values().map(|g| g.len()).sum()
    }

    /// Текущие порядки в порядке обхода.
    pub fn orders(&self) -> Vec<i32> {
        self.inner.state.lock().orders.clone()
    }

    pub fn priority(&self) -> PriorityOrder {
        self.inner.priority
    }

    /// Освобождает брокер: все группы и обработчики освобождаются,
    /// дальнейшие подписки отклоняются. Идемпотентно.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let groups = {
            let mut state = self.inner.state.lock();
            state.orders.clear();
            mem::take(&mut state.groups)
        };
        for group in groups.into_values() {
            group.dispose();
        }

        debug!(message_type = type_name::<M>(), "Broker disposed");
    }
}

impl<M> Broker<M> {
    /// Увеличивает счётчик кэширующих издателей.
    pub fn on_cache(&self) {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Уменьшает счётчик кэширующих издателей, не опуская его ниже нуля.
    pub fn on_uncache(&self) {
        let updated = self.inner.ref_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| (n > 0).then(|| n - 1),
        );
        if updated.is_err() {
            self.report(&BrokerError::UnbalancedUncache {
                message_type: type_name::<M>(),
            });
        }
    }

    /// Есть ли живые кэширующие издатели.
    pub fn is_cached(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn ref_count(&self) -> isize {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Указывают ли оба дескриптора на один брокер.
    pub fn ptr_eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn report(
        &self,
        error: &BrokerError,
    ) {
        self.inner.diagnostics.report(error);
    }
}

/// Дожидается завершения всех future группы. Возвращает число неудачных.
///
/// Паника внутри future перехватывается и сообщается как ошибка этого
/// обработчика.
async fn join_group<M>(
    tasks: impl Iterator<Item = InFlight>,
    order: i32,
    diagnostics: &dyn Diagnostics,
) -> usize {
    let outcomes = join_all(tasks.map(|InFlight { handler, future }| {
        async move { (handler, AssertUnwindSafe(future).catch_unwind().await) }
    }))
    .await;

    let mut failed = 0;
    for (handler, outcome) in outcomes {
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => BrokerError::HandlerFailed {
                handler,
                order,
                message_type: type_name::<M>(),
                reason: format!("{err:#}"),
            },
            Err(payload) => BrokerError::HandlerPanicked {
                handler,
                order,
                message_type: type_name::<M>(),
                reason: panic_reason(payload.as_ref()),
            },
        };
        failed += 1;
        diagnostics.report(&error);
    }
    failed
}

fn widest_group(bounds: &[GroupBound]) -> usize {
    let mut start = 0;
    let mut widest = 0;
    for bound in bounds {
        widest = widest.max(bound.end - start);
        start = bound.end;
    }
    widest
}

pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<M> Clone for Broker<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + Sync + 'static> Default for Broker<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Broker<M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Broker")
            .field("message_type", &type_name::<M>())
            .field("orders", &state.orders)
            .field("ref_count", &self.inner.ref_count.load(Ordering::Relaxed))
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::{sync::Barrier, time::sleep};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pubsub::MemoryDiagnostics;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn broker_with(
        priority: PriorityOrder,
        sink: &Arc<MemoryDiagnostics>,
    ) -> Broker<u32> {
        Broker::with_config(
            priority,
            Arc::new(SnapshotPools::default()),
            Arc::clone(sink) as Arc<dyn Diagnostics>,
        )
    }

    fn recording(
        log: &Log,
        tag: &'static str,
    ) -> Handler<u32> {
        let log = Arc::clone(log);
        Handler::unit(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(tag);
                Ok(())
            }
        })
    }

    /// Тест проверяет порядок запуска групп по возрастанию и по убыванию.
    #[tokio::test]
    async fn test_priority_order() {
        for (priority, expected) in [
            (PriorityOrder::Ascending, vec!["a", "b", "c"]),
            (PriorityOrder::Descending, vec!["c", "b", "a"]),
        ] {
            let sink = Arc::new(MemoryDiagnostics::new());
            let broker = broker_with(priority, &sink);
            let log = Log::default();

            let _c = broker.subscribe(recording(&log, "c"), 10);
            let _a = broker.subscribe(recording(&log, "a"), -5);
            let _b = broker.subscribe(recording(&log, "b"), 0);

            let report = broker.publish(1u32, &PublishContext::new()).await;
            assert_eq!(*log.lock(), expected);
            assert_eq!(report.groups, 3);
            assert_eq!(report.invoked, 3);
            assert!(sink.is_empty());
        }
    }

    /// Тест проверяет, что группа N+1 стартует только после завершения всех
    /// обработчиков группы N.
    #[tokio::test(start_paused = true)]
    async fn test_group_barrier() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();

        let slow_log = Arc::clone(&log);
        let _slow = broker.subscribe(
            Handler::unit(move || {
                let log = Arc::clone(&slow_log);
                async move {
                    sleep(Duration::from_millis(50)).await;
                    log.lock().push("slow");
                    Ok(())
                }
            }),
            0,
        );
        let _fast = broker.subscribe(recording(&log, "fast"), 0);
        let _next = broker.subscribe(recording(&log, "next"), 1);

        broker.publish(7u32, &PublishContext::new()).await;
        assert_eq!(*log.lock(), vec!["fast", "slow", "next"]);
    }

    /// Тест проверяет, что обработчики одной группы выполняются
    /// конкурентно.
    #[tokio::test]
    async fn test_group_members_run_concurrently() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let barrier = Arc::new(Barrier::new(2));

        // Оба обработчика ждут друг друга на барьере: без конкурентного
        // выполнения публикация зависла бы.
        let subs: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                broker.subscribe(
                    Handler::unit(move || {
                        let barrier = Arc::clone(&barrier);
                        async move {
                            barrier.wait().await;
                            Ok(())
                        }
                    }),
                    0,
                )
            })
            .collect();
        assert!(subs.iter().all(Subscription::is_active));

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            broker.publish(0u32, &PublishContext::new()),
        )
        .await
        .expect("group members must run concurrently");
        assert_eq!(report.invoked, 2);
    }

    /// Тест проверяет, что ошибки и паники обработчиков не прерывают
    /// доставку и попадают в диагностику.
    #[tokio::test]
    async fn test_failures_are_isolated() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();

        let _err = broker.subscribe(Handler::unit(|| async { Err(anyhow!("bad input")) }), 0);
        let _sync_panic = broker.subscribe(
            Handler::sync(|m: &u32| {
                assert_eq!(*m, 0, "sync boom");
                Ok(())
            }),
            0,
        );
        let _async_panic = broker.subscribe(
            Handler::message(|m: Arc<u32>| async move {
                assert_eq!(*m, 0, "async boom");
                Ok(())
            }),
            1,
        );
        let _ok = broker.subscribe(recording(&log, "ok"), 2);

        let report = broker.publish(1u32, &PublishContext::new()).await;

        assert_eq!(*log.lock(), vec!["ok"]);
        assert_eq!(report.groups, 3);
        assert_eq!(report.invoked, 4);
        assert_eq!(report.failed, 3);

        let errors = sink.take();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| matches!(
            e,
            BrokerError::HandlerFailed { reason, order: 0, .. } if reason.contains("bad input")
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            BrokerError::HandlerPanicked { reason, order: 0, .. } if reason.contains("sync boom")
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            BrokerError::HandlerPanicked { reason, order: 1, .. } if reason.contains("async boom")
        )));
    }

    /// Тест проверяет, что дубликат отклоняется, а тот же обработчик в другой
    /// группе принимается.
    #[tokio::test]
    async fn test_duplicate_subscription() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();
        let handler = recording(&log, "h");

        let first = broker.subscribe(handler.clone(), 0);
        let duplicate = broker.subscribe(handler.clone(), 0);
        let other_order = broker.subscribe(handler, 1);

        assert!(first.is_active());
        assert!(!duplicate.is_active());
        assert!(other_order.is_active());
        assert!(matches!(
            sink.errors().as_slice(),
            [BrokerError::DuplicateHandler { order: 0, .. }]
        ));

        broker.publish(0u32, &PublishContext::new()).await;
        assert_eq!(log.lock().len(), 2);

        // Пустой дескриптор дубликата не снимает первую регистрацию.
        drop(duplicate);
        assert_eq!(broker.handler_count(), 2);
    }

    /// Тест проверяет отмену между группами.
    #[tokio::test]
    async fn test_cancellation_between_groups() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();
        let token = CancellationToken::new();

        let canceller = token.clone();
        let first_log = Arc::clone(&log);
        let _first = broker.subscribe(
            Handler::unit(move || {
                let token = canceller.clone();
                let log = Arc::clone(&first_log);
                async move {
                    log.lock().push("first");
                    token.cancel();
                    Ok(())
                }
            }),
            0,
        );
        let _second = broker.subscribe(recording(&log, "second"), 1);

        let ctx = PublishContext::new().with_cancellation(token);
        let report = broker.publish(0u32, &ctx).await;

        assert_eq!(*log.lock(), vec!["first"]);
        assert!(report.cancelled);
        assert_eq!(report.groups, 1);
    }

    /// Тест проверяет, что отменённая публикация не вызывает обработчиков.
    #[tokio::test]
    async fn test_pre_cancelled_publish() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();
        let _h = broker.subscribe(recording(&log, "h"), 0);

        let token = CancellationToken::new();
        token.cancel();
        let report = broker
            .publish(0u32, &PublishContext::new().with_cancellation(token))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.invoked, 0);
        assert!(log.lock().is_empty());
    }

    /// Тест проверяет уплотнение пустых групп.
    #[tokio::test]
    async fn test_compress_removes_empty_groups() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();

        let a = broker.subscribe(recording(&log, "a"), 1);
        let _b = broker.subscribe(recording(&log, "b"), 2);
        assert_eq!(broker.orders(), vec![1, 2]);

        a.dispose();
        assert_eq!(broker.orders(), vec![1, 2]);
        assert_eq!(broker.compress(), 1);
        assert_eq!(broker.orders(), vec![2]);
        assert!(!broker.is_empty());
    }

    /// Тест проверяет, что брокер с опустевшей, но не уплотнённой группой
    /// не считается пустым.
    #[test]
    fn test_is_empty_follows_orders() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();
        assert!(broker.is_empty());

        let sub = broker.subscribe(recording(&log, "h"), 0);
        sub.dispose();

        assert_eq!(broker.orders(), vec![0]);
        assert_eq!(broker.handler_count(), 0);
        assert!(!broker.is_empty());

        broker.compress();
        assert!(broker.is_empty());
    }

    /// Тест проверяет, что счётчик кэша не опускается ниже нуля.
    #[test]
    fn test_uncache_floors_at_zero() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);

        broker.on_cache();
        assert!(broker.is_cached());
        broker.on_uncache();
        broker.on_uncache();

        assert_eq!(broker.ref_count(), 0);
        assert!(!broker.is_cached());
        assert!(matches!(
            sink.errors().as_slice(),
            [BrokerError::UnbalancedUncache { .. }]
        ));
    }

    /// Тест проверяет, что освобождённый брокер отклоняет подписки.
    #[tokio::test]
    async fn test_dispose_rejects_subscriptions() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &sink);
        let log = Log::default();
        let handler = recording(&log, "h");
        let existing = broker.subscribe(handler, 0);

        broker.dispose();
        broker.dispose();

        assert!(broker.is_disposed());
        assert!(broker.is_empty());
        assert!(broker.orders().is_empty());

        let rejected = broker.subscribe(recording(&log, "late"), 0);
        assert!(!rejected.is_active());
        assert!(matches!(
            sink.errors().as_slice(),
            [BrokerError::Disposed { .. }]
        ));

        let report = broker.publish(0u32, &PublishContext::new()).await;
        assert_eq!(report.invoked, 0);
        drop(existing);
    }

    /// Тест проверяет, что буферы снимка возвращаются в пул.
    #[tokio::test]
    async fn test_snapshot_buffers_are_pooled() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let pools = Arc::new(SnapshotPools::default());
        let broker: Broker<u32> = Broker::with_config(
            PriorityOrder::Ascending,
            Arc::clone(&pools),
            Arc::clone(&sink) as Arc<dyn Diagnostics>,
        );
        let log = Log::default();
        let _h = broker.subscribe(recording(&log, "h"), 0);

        broker.publish(0u32, &PublishContext::new()).await;
        broker.publish(0u32, &PublishContext::new()).await;

        let stats = pools.handler_stats();
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.idle, 1);
    }

    /// Тест проверяет, что при отмене future публикации посреди группы все
    /// три буфера снимка возвращаются в пул, а следующие группы не
    /// запускаются.
    #[tokio::test(start_paused = true)]
    async fn test_buffers_returned_when_publish_dropped() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let pools = Arc::new(SnapshotPools::default());
        let broker: Broker<u32> = Broker::with_config(
            PriorityOrder::Ascending,
            Arc::clone(&pools),
            Arc::clone(&sink) as Arc<dyn Diagnostics>,
        );
        let log = Log::default();
        let _stuck = broker.subscribe(Handler::unit(|| std::future::pending::<anyhow::Result<()>>()), 0);
        let _later = broker.subscribe(recording(&log, "later"), 1);

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            broker.publish(1u32, &PublishContext::new()),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(pools.handlers.idle(), 1);
        assert_eq!(pools.bounds.idle(), 1);
        assert_eq!(pools.inflight.idle(), 1);
        assert!(log.lock().is_empty());
        assert!(sink.is_empty());
    }

    /// Тест проверяет переопределение диагностики через контекст.
    #[tokio::test]
    async fn test_context_diagnostics_override() {
        let broker_sink = Arc::new(MemoryDiagnostics::new());
        let publish_sink = Arc::new(MemoryDiagnostics::new());
        let broker = broker_with(PriorityOrder::Ascending, &broker_sink);
        let _h = broker.subscribe(Handler::unit(|| async { Err(anyhow!("nope")) }), 0);

        let ctx = PublishContext::new()
            .with_diagnostics(Arc::clone(&publish_sink) as Arc<dyn Diagnostics>);
        broker.publish(0u32, &ctx).await;

        assert!(broker_sink.is_empty());
        assert_eq!(publish_sink.len(), 1);
    }
}
