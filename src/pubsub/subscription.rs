use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{group::HandlerGroup, Handler, HandlerId};

/// Действие, выполняемое после снятия обработчика (например, уплотнение
/// scoped-брокера).
pub(crate) type DisposeHook = Box<dyn FnOnce() + Send>;

trait Registration: Send + Sync {
    fn id(&self) -> HandlerId;
    fn release(&self);
}

struct GroupRegistration<M> {
    handler: Arc<Handler<M>>,
    group: Weak<HandlerGroup<M>>,
}

struct Active {
    registration: Box<dyn Registration>,
    on_dispose: Option<DisposeHook>,
}

/// Дескриптор подписки.
///
/// Уничтожение или [`Subscription::dispose`] снимает обработчик с брокера и
/// освобождает его. Повторное освобождение ничего не делает.
///
/// Отклонённая подписка (дубликат, освобождённый брокер) возвращает пустой
/// дескриптор: его освобождение тоже ничего не делает.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    inner: Mutex<Option<Active>>,
}

/// Набор подписок, освобождаемых вместе.
#[derive(Debug, Default)]
pub struct SubscriptionBag {
    items: Vec<Subscription>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<M: Send + Sync + 'static> Registration for GroupRegistration<M> {
    fn id(&self) -> HandlerId {
        self.handler.id()
    }

    fn release(&self) {
        if let Some(group) = self.group.upgrade() {
            group.remove(&self.handler);
        }
        self.handler.dispose();
    }
}

impl Subscription {
    pub(crate) fn new<M: Send + Sync + 'static>(
        handler: Arc<Handler<M>>,
        group: Weak<HandlerGroup<M>>,
        on_dispose: Option<DisposeHook>,
    ) -> Self {
        Self {
            inner: Mutex::new(Some(Active {
                registration: Box::new(GroupRegistration { handler, group }),
                on_dispose,
            })),
        }
    }

    /// Пустой дескриптор, не связанный ни с одним обработчиком.
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Связан ли дескриптор с зарегистрированным обработчиком.
    pub fn is_active(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn handler_id(&self) -> Option<HandlerId> {
        self.inner.lock().as_ref().map(|a| a.registration.id())
    }

    /// Снимает обработчик: удаляет его из группы, освобождает его и
    /// выполняет отложенное действие (уплотнение scoped-брокера).
    pub fn dispose(&self) {
        // Забираем состояние и отпускаем блокировку до вызова чужого кода.
        let Some(active) = self.inner.lock().take() else {
            return;
        };

        trace!(handler = %active.registration.id(), "Subscription disposed");
        active.registration.release();
        if let Some(hook) = active.on_dispose {
            hook();
        }
    }

    /// Явное снятие подписки с потреблением дескриптора.
    pub fn unsubscribe(self) {
        self.dispose();
    }

    /// Отвязывает дескриптор: обработчик остаётся зарегистрированным до
    /// освобождения брокера.
    pub fn detach(self) {
        let released = self.inner.lock().take();
        drop(released);
    }

    /// Снимает подписку, когда срабатывает `token`.
    ///
    /// Требует активного рантайма tokio.
    pub fn dispose_on_cancel(
        self,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            token.cancelled().await;
            self.dispose();
        })
    }
}

impl SubscriptionBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        subscription: Subscription,
    ) {
        self.items.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Освобождает все подписки набора.
    pub fn clear(&mut self) {
        for subscription in self.items.drain(..) {
            subscription.dispose();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handler", &self.handler_id())
            .finish()
    }
}

impl Extend<Subscription> for SubscriptionBag {
    fn extend<I: IntoIterator<Item = Subscription>>(
        &mut self,
        iter: I,
    ) {
        self.items.extend(iter);
    }
}

impl FromIterator<Subscription> for SubscriptionBag {
    fn from_iter<I: IntoIterator<Item = Subscription>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
