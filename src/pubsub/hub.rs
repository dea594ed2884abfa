use std::{
    any::{type_name, Any, TypeId},
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CachedPublisher, DeliveryReport, Diagnostics, Handler, PublishContext, PublishStrategy,
    Scope, ScopedBroker, SnapshotPools, Subscription, TracingDiagnostics,
};
use crate::{
    config::HubConfig,
    error::{BrokerError, ConfigError},
};

/// Ограничения на тип сообщения.
pub trait Message: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Message for T {}

/// Запись реестра: [`ScopedBroker`] со стёртыми типами.
trait RegistryEntry: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn compress(&self) -> usize;
    fn dispose(&self);
}

impl<S: Scope, M: Message> RegistryEntry for ScopedBroker<S, M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn compress(&self) -> usize {
        ScopedBroker::compress(self)
    }

    fn dispose(&self) {
        ScopedBroker::dispose(self)
    }
}

/// Точка входа: реестр брокеров, индексированный типом сообщения (и типом
/// области видимости).
///
/// Публикация без областей использует область `()`.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: RwLock<FxHashMap<TypeId, Arc<dyn RegistryEntry>>>,
    registered: Notify,
    config: HubConfig,
    diagnostics: Arc<dyn Diagnostics>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl MessageHub {
    /// Хаб с диагностикой через `tracing`. Некорректные настройки
    /// отклоняются.
    pub fn new(config: HubConfig) -> Result<Self, ConfigError> {
        Self::with_diagnostics(config, Arc::new(TracingDiagnostics))
    }

    pub fn with_diagnostics(
        config: HubConfig,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, diagnostics))
    }

    fn build(
        config: HubConfig,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(FxHashMap::default()),
                registered: Notify::new(),
                config,
                diagnostics,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Scoped-брокер для пары `(S, M)`, созданный при первом обращении.
    ///
    /// При гонке двух создателей побеждает первый записавший; экземпляр
    /// проигравшего освобождается.
    pub fn scoped<S: Scope, M: Message>(&self) -> ScopedBroker<S, M> {
        if let Some(existing) = self.lookup::<S, M>() {
            return existing;
        }

        let config = &self.inner.config;
        let created = ScopedBroker::with_config(
            config.priority_order,
            Arc::new(SnapshotPools::new(
                config.pool_max_buffers,
                config.pool_max_capacity,
            )),
            Arc::clone(&self.inner.diagnostics),
        );

        let existing = {
            let mut registry = self.inner.registry.write();
            match registry.get(&key::<S, M>()) {
                Some(entry) => downcast::<S, M>(entry.as_ref()),
                None => {
                    registry.insert(key::<S, M>(), Arc::new(created.clone()));
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                created.dispose();
                existing
            }
            None => {
                debug!(
                    scope_type = type_name::<S>(),
                    message_type = type_name::<M>(),
                    "Broker registered"
                );
                self.inner.registered.notify_waiters();
                created
            }
        }
    }

    fn lookup<S: Scope, M: Message>(&self) -> Option<ScopedBroker<S, M>> {
        let registry = self.inner.registry.read();
        registry
            .get(&key::<S, M>())
            .and_then(|entry| downcast::<S, M>(entry.as_ref()))
    }

    /// Зарегистрирован ли брокер для пары `(S, M)`.
    pub fn is_registered<S: Scope, M: Message>(&self) -> bool {
        self.inner
            .registry
            .read()
            .contains_key(&key::<S, M>())
    }

    /// Число зарегистрированных пар `(S, M)`.
    pub fn registered_types(&self) -> usize {
        self.inner.registry.read().len()
    }

    pub fn subscribe<M: Message>(
        &self,
        handler: Handler<M>,
        order: i32,
    ) -> Subscription {
        self.subscribe_scoped((), handler, order)
    }

    pub fn subscribe_scoped<S: Scope, M: Message>(
        &self,
        scope: S,
        handler: Handler<M>,
        order: i32,
    ) -> Subscription {
        self.scoped::<S, M>().subscribe(scope, handler, order)
    }

    pub async fn publish<M: Message>(
        &self,
        message: impl Into<Arc<M>>,
        context: &PublishContext,
    ) -> DeliveryReport {
        self.publish_scoped((), message, context).await
    }

    /// Публикует сообщение в область `scope`.
    ///
    /// Если брокер для типа ещё не зарегистрирован, поведение задаёт
    /// [`PublishStrategy`] контекста: немедленный возврат (с диагностикой,
    /// если включено `warn_if_no_subscriber`) или ожидание регистрации до
    /// отмены.
    pub async fn publish_scoped<S: Scope, M: Message>(
        &self,
        scope: S,
        message: impl Into<Arc<M>>,
        context: &PublishContext,
    ) -> DeliveryReport {
        let message: Arc<M> = message.into();

        let scoped = match self.lookup::<S, M>() {
            Some(scoped) => scoped,
            None if context.strategy() == PublishStrategy::WaitForSubscriber => {
                match self.wait_for::<S, M>(context.cancellation()).await {
                    Some(scoped) => scoped,
                    None => return DeliveryReport::cancelled(),
                }
            }
            None => {
                self.warn_no_subscriber::<M>(context);
                return DeliveryReport::default();
            }
        };

        let report = scoped.publish(&scope, message, context).await;
        if report.groups == 0 && !report.cancelled {
            self.warn_no_subscriber::<M>(context);
        }
        report
    }

    /// Запускает публикацию в фоне, не дожидаясь результата.
    pub fn publish_and_forget<M: Message>(
        &self,
        message: impl Into<Arc<M>>,
        context: PublishContext,
    ) {
        self.publish_scoped_and_forget((), message, context)
    }

    /// Как [`MessageHub::publish_and_forget`], но в область `scope`.
    ///
    /// Вне рантайма tokio сообщение отбрасывается с предупреждением.
    pub fn publish_scoped_and_forget<S: Scope, M: Message>(
        &self,
        scope: S,
        message: impl Into<Arc<M>>,
        context: PublishContext,
    ) {
        let message: Arc<M> = message.into();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                message_type = type_name::<M>(),
                "publish_and_forget called outside of a tokio runtime, message dropped"
            );
            return;
        };

        let hub = self.clone();
        runtime.spawn(async move {
            hub.publish_scoped::<S, M>(scope, message, &context).await;
        });
    }

    /// Кэширующий издатель для брокера без области.
    pub fn cache<M: Message>(&self) -> CachedPublisher<(), M> {
        self.cache_scoped(())
    }

    /// Кэширующий издатель для области `scope`. Пока он жив, брокер области
    /// не удаляется уплотнением.
    pub fn cache_scoped<S: Scope, M: Message>(
        &self,
        scope: S,
    ) -> CachedPublisher<S, M> {
        let broker = self.scoped::<S, M>().cache(scope.clone());
        CachedPublisher::new(scope, broker, None)
    }

    /// Кэширующий издатель с фабрикой сообщений для
    /// [`CachedPublisher::publish_new`].
    pub fn cache_with<S, M, F>(
        &self,
        scope: S,
        factory: F,
    ) -> CachedPublisher<S, M>
    where
        S: Scope,
        M: Message,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let broker = self.scoped::<S, M>().cache(scope.clone());
        CachedPublisher::new(scope, broker, Some(Arc::new(factory)))
    }

    /// Уплотняет все зарегистрированные брокеры. Возвращает число удалённых
    /// областей.
    pub fn compress(&self) -> usize {
        let entries: Vec<Arc<dyn RegistryEntry>> =
            self.inner.registry.read().values().cloned().collect();
        entries.iter().map(|entry| entry.compress()).sum()
    }

    /// Освобождает все брокеры и очищает реестр.
    pub fn dispose(&self) {
        let entries: Vec<Arc<dyn RegistryEntry>> = {
            let mut registry = self.inner.registry.write();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.dispose();
        }
        debug!(brokers = entries.len(), "Message hub disposed");
    }

    /// Ждёт регистрации брокера `(S, M)` или отмены.
    ///
    /// Просыпается по уведомлению о регистрации, а также периодически с
    /// интервалом `wait_poll_interval_ms`.
    async fn wait_for<S: Scope, M: Message>(
        &self,
        token: &CancellationToken,
    ) -> Option<ScopedBroker<S, M>> {
        let interval = self.inner.config.wait_poll_interval();
        loop {
            let notified = self.inner.registered.notified();
            tokio::pin!(notified);
            // Подписываемся на уведомление до проверки, чтобы не пропустить
            // регистрацию между проверкой и ожиданием.
            notified.as_mut().enable();

            if let Some(scoped) = self.lookup::<S, M>() {
                return Some(scoped);
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    fn warn_no_subscriber<M: Message>(
        &self,
        context: &PublishContext,
    ) {
        let warn = context
            .warn_override()
            .unwrap_or(self.inner.config.warn_if_no_subscriber);
        if !warn {
            return;
        }

        let sink = context.diagnostics().unwrap_or(&self.inner.diagnostics);
        sink.report(&BrokerError::NoSubscriber {
            message_type: type_name::<M>(),
        });
    }
}

fn key<S: 'static, M: 'static>() -> TypeId {
    TypeId::of::<(S, M)>()
}

fn downcast<S: Scope, M: Message>(entry: &dyn RegistryEntry) -> Option<ScopedBroker<S, M>> {
    entry
        .as_any()
        .downcast_ref::<ScopedBroker<S, M>>()
        .cloned()
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for MessageHub {
    fn default() -> Self {
        Self::build(HubConfig::default(), Arc::new(TracingDiagnostics))
    }
}

impl fmt::Debug for MessageHub {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("MessageHub")
            .field("registered_types", &self.registered_types())
            .field("config", &self.inner.config)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
