use std::{
    any::Any,
    fmt,
    future::{ready, Future},
    pin::Pin,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::PublishContext;

/// Future, возвращаемый обработчиком сообщения.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type UnitFn = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;
type MessageFn<M> = Arc<dyn Fn(Arc<M>) -> HandlerFuture + Send + Sync>;
type ContextFn = Arc<dyn Fn(PublishContext) -> HandlerFuture + Send + Sync>;
type MessageContextFn<M> = Arc<dyn Fn(Arc<M>, PublishContext) -> HandlerFuture + Send + Sync>;
type UnitCancelFn = Arc<dyn Fn(CancellationToken) -> HandlerFuture + Send + Sync>;
type MessageCancelFn<M> = Arc<dyn Fn(Arc<M>, CancellationToken) -> HandlerFuture + Send + Sync>;
type ContextCancelFn = Arc<dyn Fn(PublishContext, CancellationToken) -> HandlerFuture + Send + Sync>;
type FullFn<M> =
    Arc<dyn Fn(Arc<M>, PublishContext, CancellationToken) -> HandlerFuture + Send + Sync>;
type ErasedOwner = Arc<dyn Any + Send + Sync>;
type BoundFn<M> = Arc<
    dyn Fn(ErasedOwner, Arc<M>, PublishContext, CancellationToken) -> HandlerFuture + Send + Sync,
>;

/// Уникальный идентификатор обработчика.
///
/// Строится из адреса аллокации callback'а и, для обработчиков с
/// владельцем, адреса владельца. Два клона одного [`Handler`] имеют
/// одинаковый идентификатор.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId {
    callback: usize,
    owner: usize,
}

/// Набор возможностей, которые получает callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Unit,
    Message,
    Context,
    MessageContext,
    UnitCancellable,
    MessageCancellable,
    ContextCancellable,
    Full,
    Bound,
}

enum Callback<M> {
    Unit(UnitFn),
    Message(MessageFn<M>),
    Context(ContextFn),
    MessageContext(MessageContextFn<M>),
    UnitCancellable(UnitCancelFn),
    MessageCancellable(MessageCancelFn<M>),
    ContextCancellable(ContextCancelFn),
    Full(FullFn<M>),
    Bound {
        owner: Weak<dyn Any + Send + Sync>,
        call: BoundFn<M>,
    },
}

/// Обработчик сообщений типа `M`.
///
/// Оборачивает пользовательский callback одной из форм (см. конструкторы) и
/// предоставляет единый асинхронный вызов [`Handler::handle`].
///
/// - Если токен отмены уже сработал, callback не вызывается.
/// - Если владелец (для [`Handler::bound`]) уже уничтожен, callback не
///   вызывается.
/// - После [`Handler::dispose`] любые вызовы сразу завершаются успешно.
pub struct Handler<M> {
    id: HandlerId,
    kind: HandlerKind,
    callback: RwLock<Option<Callback<M>>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl HandlerId {
    /// Адрес callback'а.
    pub fn callback_addr(&self) -> usize {
        self.callback
    }

    /// Адрес владельца, если обработчик привязан к состоянию.
    pub fn owner_addr(&self) -> Option<usize> {
        (self.owner != 0).then_some(self.owner)
    }
}

impl<M> Callback<M> {
    fn kind(&self) -> HandlerKind {
        match self {
            Self::Unit(_) => HandlerKind::Unit,
            Self::Message(_) => HandlerKind::Message,
            Self::Context(_) => HandlerKind::Context,
            Self::MessageContext(_) => HandlerKind::MessageContext,
            Self::UnitCancellable(_) => HandlerKind::UnitCancellable,
            Self::MessageCancellable(_) => HandlerKind::MessageCancellable,
            Self::ContextCancellable(_) => HandlerKind::ContextCancellable,
            Self::Full(_) => HandlerKind::Full,
            Self::Bound { .. } => HandlerKind::Bound,
        }
    }

    fn id(&self) -> HandlerId {
        let callback = match self {
            Self::Unit(f) => addr_of(f),
            Self::Message(f) => addr_of(f),
            Self::Context(f) => addr_of(f),
            Self::MessageContext(f) => addr_of(f),
            Self::UnitCancellable(f) => addr_of(f),
            Self::MessageCancellable(f) => addr_of(f),
            Self::ContextCancellable(f) => addr_of(f),
            Self::Full(f) => addr_of(f),
            Self::Bound { call, .. } => addr_of(call),
        };
        let owner = match self {
            Self::Bound { owner, .. } => Weak::as_ptr(owner) as *const () as usize,
            _ => 0,
        };
        HandlerId { callback, owner }
    }
}

impl<M: Send + Sync + 'static> Handler<M> {
    fn from_callback(callback: Callback<M>) -> Self {
        Self {
            id: callback.id(),
            kind: callback.kind(),
            callback: RwLock::new(Some(callback)),
        }
    }

    /// Обработчик без аргументов.
    pub fn unit<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move || -> HandlerFuture { Box::pin(f()) };
        Self::from_callback(Callback::Unit(Arc::new(call)))
    }

    /// Обработчик, получающий только сообщение.
    pub fn message<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |m: Arc<M>| -> HandlerFuture { Box::pin(f(m)) };
        Self::from_callback(Callback::Message(Arc::new(call)))
    }

    /// Синхронный обработчик: выполняется прямо в момент запуска группы.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let call = move |m: Arc<M>| -> HandlerFuture { Box::pin(ready(f(&m))) };
        Self::from_callback(Callback::Message(Arc::new(call)))
    }

    /// Обработчик, получающий только контекст публикации.
    pub fn context<F, Fut>(f: F) -> Self
    where
        F: Fn(PublishContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |ctx: PublishContext| -> HandlerFuture { Box::pin(f(ctx)) };
        Self::from_callback(Callback::Context(Arc::new(call)))
    }

    /// Обработчик, получающий сообщение и контекст.
    pub fn message_context<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<M>, PublishContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |m: Arc<M>, ctx: PublishContext| -> HandlerFuture { Box::pin(f(m, ctx)) };
        Self::from_callback(Callback::MessageContext(Arc::new(call)))
    }

    /// Обработчик без аргументов, наблюдающий токен отмены.
    pub fn unit_cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |token: CancellationToken| -> HandlerFuture { Box::pin(f(token)) };
        Self::from_callback(Callback::UnitCancellable(Arc::new(call)))
    }

    /// Обработчик сообщения с токеном отмены.
    pub fn message_cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<M>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |m: Arc<M>, token: CancellationToken| -> HandlerFuture {
            Box::pin(f(m, token))
        };
        Self::from_callback(Callback::MessageCancellable(Arc::new(call)))
    }

    /// Обработчик контекста с токеном отмены.
    pub fn context_cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(PublishContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call = move |ctx: PublishContext, token: CancellationToken| -> HandlerFuture {
            Box::pin(f(ctx, token))
        };
        Self::from_callback(Callback::ContextCancellable(Arc::new(call)))
    }

    /// Обработчик, получающий сообщение, контекст и токен отмены.
    pub fn full<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<M>, PublishContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let call =
            move |m: Arc<M>, ctx: PublishContext, token: CancellationToken| -> HandlerFuture {
                Box::pin(f(m, ctx, token))
            };
        Self::from_callback(Callback::Full(Arc::new(call)))
    }

    /// Обработчик, привязанный к владельцу `owner`.
    ///
    /// Владелец хранится по слабой ссылке: подписка не продлевает его жизнь.
    /// Когда последний `Arc<S>` уничтожен, вызовы становятся no-op.
    pub fn bound<S, F, Fut>(
        owner: &Arc<S>,
        f: F,
    ) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::bound_full(owner, move |state, m, _ctx, _token| f(state, m))
    }

    /// Как [`Handler::bound`], но callback получает также контекст и токен
    /// отмены.
    pub fn bound_full<S, F, Fut>(
        owner: &Arc<S>,
        f: F,
    ) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Arc<M>, PublishContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let erased: ErasedOwner = Arc::clone(owner) as ErasedOwner;
        let owner = Arc::downgrade(&erased);
        drop(erased);

        let call = move |state: ErasedOwner,
                         m: Arc<M>,
                         ctx: PublishContext,
                         token: CancellationToken|
              -> HandlerFuture {
            match state.downcast::<S>() {
                Ok(state) => Box::pin(f(state, m, ctx, token)),
                Err(_) => Box::pin(ready(Ok(()))),
            }
        };
        let call: BoundFn<M> = Arc::new(call);
        Self::from_callback(Callback::Bound { owner, call })
    }

    /// Идентификатор обработчика (ключ удаления и проверки дубликатов).
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Форма callback'а.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Возвращает `true`, если обработчик уже освобождён.
    pub fn is_disposed(&self) -> bool {
        self.callback.read().is_none()
    }

    /// Возвращает `true`, если обработчик привязан к владельцу и владелец
    /// ещё жив. Для обработчиков без владельца всегда `true`, пока они не
    /// освобождены.
    pub fn is_alive(&self) -> bool {
        match &*self.callback.read() {
            Some(Callback::Bound { owner, .. }) => owner.strong_count() > 0,
            Some(_) => true,
            None => false,
        }
    }

    /// Вызывает обработчик.
    ///
    /// Возвращает уже завершённый future, если токен отмены сработал,
    /// владелец уничтожен или обработчик освобождён.
    pub fn handle(
        &self,
        message: &Arc<M>,
        context: &PublishContext,
    ) -> HandlerFuture {
        self.invoke(message, context)
            .unwrap_or_else(|| Box::pin(ready(Ok(()))))
    }

    /// Запускает callback. `None` означает, что вызов был пропущен.
    pub(crate) fn invoke(
        &self,
        message: &Arc<M>,
        context: &PublishContext,
    ) -> Option<HandlerFuture> {
        let token = context.cancellation();
        if token.is_cancelled() {
            return None;
        }

        // Клонируем callback из-под блокировки: сам вызов может освободить
        // этот же обработчик.
        let callback = self.callback.read().clone()?;

        let fut = match callback {
            Callback::Unit(f) => f(),
            Callback::Message(f) => f(Arc::clone(message)),
            Callback::Context(f) => f(context.clone()),
            Callback::MessageContext(f) => f(Arc::clone(message), context.clone()),
            Callback::UnitCancellable(f) => f(token.clone()),
            Callback::MessageCancellable(f) => f(Arc::clone(message), token.clone()),
            Callback::ContextCancellable(f) => f(context.clone(), token.clone()),
            Callback::Full(f) => f(Arc::clone(message), context.clone(), token.clone()),
            Callback::Bound { owner, call } => {
                let state = owner.upgrade()?;
                call(state, Arc::clone(message), context.clone(), token.clone())
            }
        };
        Some(fut)
    }

    /// Освобождает callback и слабую ссылку на владельца.
    ///
    /// Идемпотентно; безопасно вызывать параллельно с выполняющимся
    /// `handle`.
    pub fn dispose(&self) {
        let released = self.callback.write().take();
        drop(released);
    }
}

fn addr_of<T: ?Sized>(f: &Arc<T>) -> usize {
    Arc::as_ptr(f) as *const () as usize
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<M> Clone for Callback<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Unit(f) => Self::Unit(Arc::clone(f)),
            Self::Message(f) => Self::Message(Arc::clone(f)),
            Self::Context(f) => Self::Context(Arc::clone(f)),
            Self::MessageContext(f) => Self::MessageContext(Arc::clone(f)),
            Self::UnitCancellable(f) => Self::UnitCancellable(Arc::clone(f)),
            Self::MessageCancellable(f) => Self::MessageCancellable(Arc::clone(f)),
            Self::ContextCancellable(f) => Self::ContextCancellable(Arc::clone(f)),
            Self::Full(f) => Self::Full(Arc::clone(f)),
            Self::Bound { owner, call } => Self::Bound {
                owner: Weak::clone(owner),
                call: Arc::clone(call),
            },
        }
    }
}

/// Клон разделяет callback (и идентификатор), но освобождается независимо.
impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            callback: RwLock::new(self.callback.read().clone()),
        }
    }
}

impl<M> fmt::Debug for Handler<M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("disposed", &self.callback.read().is_none())
            .finish()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.owner_addr() {
            Some(owner) => write!(f, "{:#x}@{:#x}", self.callback, owner),
            None => write!(f, "{:#x}", self.callback),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
