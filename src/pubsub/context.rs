use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::Diagnostics;

/// Поведение публикации, когда для типа сообщения ещё нет ни одного брокера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// Завершить публикацию сразу.
    #[default]
    Immediate,
    /// Ждать регистрации брокера (или отмены).
    WaitForSubscriber,
}

/// Контекст одной публикации.
///
/// Клонируется в каждый обработчик, который его запрашивает. Несёт токен
/// отмены, стратегию ожидания подписчика и, при необходимости, отдельный
/// приёмник диагностики для этой публикации.
#[derive(Clone, Default)]
pub struct PublishContext {
    cancellation: CancellationToken,
    strategy: PublishStrategy,
    warn_if_no_subscriber: Option<bool>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

/// Итог публикации.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Сколько групп приоритета было запущено.
    pub groups: usize,
    /// Сколько обработчиков было фактически вызвано.
    pub invoked: usize,
    /// Сколько обработчиков завершилось ошибкой или паникой.
    pub failed: usize,
    /// Публикация остановлена отменой до запуска всех групп.
    pub cancelled: bool,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl PublishContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Использовать указанный токен отмены.
    pub fn with_cancellation(
        mut self,
        token: CancellationToken,
    ) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_strategy(
        mut self,
        strategy: PublishStrategy,
    ) -> Self {
        self.strategy = strategy;
        self
    }

    /// Сокращение для [`PublishStrategy::WaitForSubscriber`].
    pub fn wait_for_subscriber(self) -> Self {
        self.with_strategy(PublishStrategy::WaitForSubscriber)
    }

    /// Переопределяет настройку хаба `warn_if_no_subscriber` для этой
    /// публикации.
    pub fn warn_if_no_subscriber(
        mut self,
        warn: bool,
    ) -> Self {
        self.warn_if_no_subscriber = Some(warn);
        self
    }

    /// Направляет ошибки этой публикации в `sink` вместо приёмника брокера.
    pub fn with_diagnostics(
        mut self,
        sink: Arc<dyn Diagnostics>,
    ) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn strategy(&self) -> PublishStrategy {
        self.strategy
    }

    pub fn warn_override(&self) -> Option<bool> {
        self.warn_if_no_subscriber
    }

    pub fn diagnostics(&self) -> Option<&Arc<dyn Diagnostics>> {
        self.diagnostics.as_ref()
    }
}

impl DeliveryReport {
    pub(crate) fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    /// Был ли вызван хотя бы один обработчик.
    pub fn is_delivered(&self) -> bool {
        self.invoked > 0
    }

    /// Все вызванные обработчики завершились успешно, и публикация не была
    /// прервана.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Debug for PublishContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PublishContext")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("strategy", &self.strategy)
            .field("warn_if_no_subscriber", &self.warn_if_no_subscriber)
            .field("custom_diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}
