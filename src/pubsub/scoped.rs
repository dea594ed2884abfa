use std::{
    any::type_name,
    fmt::{self, Debug},
    hash::Hash,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use tracing::debug;

use super::{
    subscription::DisposeHook, Broker, DeliveryReport, Diagnostics, Handler, PriorityOrder,
    PublishContext, SnapshotPools, Subscription, TracingDiagnostics,
};

/// Ключ области видимости.
pub trait Scope: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> Scope for T {}

/// Брокер, разделённый по ключу области видимости.
///
/// Для каждого ключа лениво создаётся свой [`Broker`]. Брокер области
/// удаляется, когда в нём не осталось обработчиков и нет кэширующих
/// издателей.
///
/// Порядок захвата блокировок: карта областей, затем брокер, затем группа.
pub struct ScopedBroker<S, M> {
    inner: Arc<ScopedInner<S, M>>,
}

struct ScopedInner<S, M> {
    brokers: DashMap<S, Broker<M>>,
    priority: PriorityOrder,
    pools: Arc<SnapshotPools<M>>,
    diagnostics: Arc<dyn Diagnostics>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<S: Scope, M: Send + Sync + 'static> ScopedBroker<S, M> {
    pub fn new() -> Self {
        Self::with_config(
            PriorityOrder::default(),
            Arc::new(SnapshotPools::default()),
            Arc::new(TracingDiagnostics),
        )
    }

    /// Все брокеры областей разделяют `pools` и `diagnostics`.
    pub fn with_config(
        priority: PriorityOrder,
        pools: Arc<SnapshotPools<M>>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            inner: Arc::new(ScopedInner {
                brokers: DashMap::new(),
                priority,
                pools,
                diagnostics,
            }),
        }
    }

    fn new_broker(&self) -> Broker<M> {
        Broker::with_config(
            self.inner.priority,
            Arc::clone(&self.inner.pools),
            Arc::clone(&self.inner.diagnostics),
        )
    }

    /// Подписывает обработчик в области `scope`, создавая её брокер при
    /// необходимости.
    ///
    /// Освобождение подписки удаляет брокер области, если он опустел и не
    /// закэширован.
    pub fn subscribe(
        &self,
        scope: S,
        handler: Handler<M>,
        order: i32,
    ) -> Subscription {
        let hook = compress_hook(Arc::downgrade(&self.inner), scope.clone());
        let subscribed = {
            let entry = self
                .inner
                .brokers
                .entry(scope)
                .or_insert_with(|| self.new_broker());
            entry
                .value()
                .try_subscribe_with_hook(handler, order, Some(hook))
        };

        // Диагностика вызывается после освобождения записи карты: приёмник
        // может обращаться к этому же брокеру.
        subscribed.unwrap_or_else(|err| {
            self.inner.diagnostics.report(&err);
            Subscription::empty()
        })
    }

    /// Возвращает брокер области и увеличивает его счётчик кэширования.
    ///
    /// Вызывающий обязан вызвать [`Broker::on_uncache`] ровно один раз.
    pub fn cache(
        &self,
        scope: S,
    ) -> Broker<M> {
        let entry = self
            .inner
            .brokers
            .entry(scope)
            .or_insert_with(|| self.new_broker());
        let broker = entry.value().clone();
        // Под блокировкой области, чтобы уплотнение не удалило брокер между
        // получением и увеличением счётчика.
        broker.on_cache();
        broker
    }

    /// Уплотняет все брокеры и удаляет пустые некэшированные области.
    /// Возвращает число удалённых областей.
    pub fn compress(&self) -> usize {
        let mut evicted = Vec::new();
        self.inner.brokers.retain(|_, broker| {
            broker.compress();
            if broker.is_empty() && !broker.is_cached() {
                evicted.push(broker.clone());
                false
            } else {
                true
            }
        });

        for broker in &evicted {
            broker.dispose();
        }
        if !evicted.is_empty() {
            debug!(
                scopes = evicted.len(),
                message_type = type_name::<M>(),
                "Scoped broker compressed"
            );
        }
        evicted.len()
    }

    /// Уплотняет одну область и удаляет её, если она пуста и не
    /// закэширована.
    pub fn compress_scope(
        &self,
        scope: &S,
    ) -> bool {
        self.inner.compress_scope(scope)
    }

    /// Публикует сообщение в область `scope`. Если области нет, возвращает
    /// пустой отчёт.
    pub async fn publish(
        &self,
        scope: &S,
        message: impl Into<Arc<M>>,
        context: &PublishContext,
    ) -> DeliveryReport {
        let message: Arc<M> = message.into();
        let broker = self.broker(scope);
        match broker {
            Some(broker) => broker.publish(message, context).await,
            None => DeliveryReport::default(),
        }
    }

    /// Брокер области, если он существует.
    pub fn broker(
        &self,
        scope: &S,
    ) -> Option<Broker<M>> {
        self.inner.brokers.get(scope).map(|e| e.value().clone())
    }

    pub fn contains_scope(
        &self,
        scope: &S,
    ) -> bool {
        self.inner.brokers.contains_key(scope)
    }

    pub fn scope_count(&self) -> usize {
        self.inner.brokers.len()
    }

    pub fn scopes(&self) -> Vec<S> {
        self.inner
            .brokers
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Освобождает все брокеры областей и очищает карту.
    pub fn dispose(&self) {
        let brokers: Vec<Broker<M>> = self
            .inner
            .brokers
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.inner.brokers.clear();
        for broker in brokers {
            broker.dispose();
        }
    }
}

impl<S: Scope, M: Send + Sync + 'static> ScopedInner<S, M> {
    fn compress_scope(
        &self,
        scope: &S,
    ) -> bool {
        let removed = self.brokers.remove_if(scope, |_, broker| {
            if broker.is_cached() {
                return false;
            }
            broker.compress();
            broker.is_empty()
        });

        match removed {
            Some((scope, broker)) => {
                broker.dispose();
                debug!(
                    ?scope,
                    message_type = type_name::<M>(),
                    "Scope removed"
                );
                true
            }
            None => false,
        }
    }
}

fn compress_hook<S: Scope, M: Send + Sync + 'static>(
    inner: Weak<ScopedInner<S, M>>,
    scope: S,
) -> DisposeHook {
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            inner.compress_scope(&scope);
        }
    })
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<S, M> Clone for ScopedBroker<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Scope, M: Send + Sync + 'static> Default for ScopedBroker<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scope, M> fmt::Debug for ScopedBroker<S, M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ScopedBroker")
            .field("scope_type", &type_name::<S>())
            .field("message_type", &type_name::<M>())
            .field("scopes", &self.inner.brokers.len())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
