use std::{
    any::type_name,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use super::{Broker, DeliveryReport, PublishContext};
use crate::error::HubError;

type Factory<M> = Arc<dyn Fn() -> M + Send + Sync>;

/// Издатель, удерживающий брокер одной области.
///
/// Публикует без обращения к реестру хаба. Пока издатель жив, брокер его
/// области не удаляется уплотнением. Освобождается явно через
/// [`CachedPublisher::dispose`] или при уничтожении.
pub struct CachedPublisher<S, M> {
    scope: S,
    broker: Broker<M>,
    factory: Option<Factory<M>>,
    disposed: AtomicBool,
}

impl<S, M: Send + Sync + 'static> CachedPublisher<S, M> {
    /// `broker` уже должен быть закэширован (`on_cache`).
    pub(crate) fn new(
        scope: S,
        broker: Broker<M>,
        factory: Option<Factory<M>>,
    ) -> Self {
        Self {
            scope,
            broker,
            factory,
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn publish(
        &self,
        message: impl Into<Arc<M>>,
        context: &PublishContext,
    ) -> Result<DeliveryReport, HubError> {
        let message: Arc<M> = message.into();
        self.ensure_active()?;
        Ok(self.broker.publish(message, context).await)
    }

    /// Публикует сообщение, созданное фабрикой издателя.
    pub async fn publish_new(
        &self,
        context: &PublishContext,
    ) -> Result<DeliveryReport, HubError> {
        self.ensure_active()?;
        let factory = self.factory.as_ref().ok_or(HubError::MissingFactory {
            message_type: type_name::<M>(),
        })?;
        let message = Arc::new(factory());
        Ok(self.broker.publish(message, context).await)
    }

    /// Количество обработчиков в брокере области.
    pub fn handler_count(&self) -> usize {
        self.broker.handler_count()
    }
}

impl<S, M> CachedPublisher<S, M> {
    pub fn scope(&self) -> &S {
        &self.scope
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Снимает удержание брокера. Идемпотентно.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.broker.on_uncache();
        }
    }

    fn ensure_active(&self) -> Result<(), HubError> {
        if self.is_disposed() {
            return Err(HubError::Disposed {
                message_type: type_name::<M>(),
            });
        }
        Ok(())
    }
}

impl<S, M> Drop for CachedPublisher<S, M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<S: fmt::Debug, M> fmt::Debug for CachedPublisher<S, M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CachedPublisher")
            .field("scope", &self.scope)
            .field("message_type", &type_name::<M>())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        config::HubConfig,
        pubsub::{Handler, MessageHub},
    };

    #[derive(Debug, Default)]
    struct Tick;

    fn tick_counter(counter: &Arc<AtomicUsize>) -> Handler<Tick> {
        let counter = Arc::clone(counter);
        Handler::unit(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Тест проверяет публикацию через кэширующий издатель и фабрику.
    #[tokio::test]
    async fn test_publish_and_publish_new() {
        let hub = MessageHub::new(HubConfig::default()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let _sub = hub.subscribe_scoped("room", tick_counter(&counter), 0);

        let publisher = hub.cache_with("room", Tick::default);
        publisher.publish(Tick, &PublishContext::new()).await.unwrap();
        publisher.publish_new(&PublishContext::new()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.handler_count(), 1);
        assert_eq!(*publisher.scope(), "room");
    }

    /// Тест проверяет ошибку при отсутствии фабрики.
    #[tokio::test]
    async fn test_missing_factory() {
        let hub = MessageHub::default();
        let publisher = hub.cache::<Tick>();

        let err = publisher
            .publish_new(&PublishContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::MissingFactory { .. }));
    }

    /// Тест проверяет, что освобождённый издатель отклоняет публикации, а
    /// счётчик кэша уменьшается ровно один раз.
    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let hub = MessageHub::default();
        let publisher = hub.cache::<Tick>();
        let broker = hub.scoped::<(), Tick>().broker(&()).unwrap();
        assert_eq!(broker.ref_count(), 1);

        publisher.dispose();
        publisher.dispose();
        assert_eq!(broker.ref_count(), 0);

        let err = publisher
            .publish(Tick, &PublishContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Disposed { .. }));

        drop(publisher);
        assert_eq!(broker.ref_count(), 0);
    }

    /// Тест проверяет, что уничтожение издателя снимает удержание области.
    #[test]
    fn test_drop_releases_scope() {
        let hub = MessageHub::default();
        let scoped = hub.scoped::<u8, Tick>();

        let publisher = hub.cache_scoped::<u8, Tick>(3);
        assert_eq!(hub.compress(), 0);
        assert!(scoped.contains_scope(&3));

        drop(publisher);
        assert_eq!(hub.compress(), 1);
        assert!(!scoped.contains_scope(&3));
    }
}
