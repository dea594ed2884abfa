//! Mercury: внутрипроцессная типизированная шина сообщений.
//!
//! Обработчики подписываются на тип сообщения с целочисленным приоритетом.
//! Публикация выполняет группы приоритетов последовательно, а обработчики
//! внутри группы конкурентно.

/// Загрузка настроек хаба.
pub mod config;
/// Ошибки брокера, хаба и настроек.
pub mod error;
/// Инициализация `tracing` (консоль, файл, фильтры).
pub mod logging;
/// Pub/Sub: обработчики, брокеры, хаб, подписки.
pub mod pubsub;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Настройки хаба.
pub use config::HubConfig;
/// Ошибки и коды статуса.
pub use error::{BrokerError, ConfigError, HubError};
/// Логирование.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
pub use mercury_error::{ErrorExt, StatusCode};
/// Pub/Sub API.
pub use pubsub::{
    Broker, CachedPublisher, DeliveryReport, Diagnostics, Handler, HandlerId, MemoryDiagnostics,
    Message, MessageHub, PriorityOrder, PublishContext, PublishStrategy, Scope, ScopedBroker,
    Subscription, SubscriptionBag, TracingDiagnostics,
};
/// Токен отмены, принимаемый контекстом публикации.
pub use tokio_util::sync::CancellationToken;
