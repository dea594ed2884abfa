//! Подсистема Publish–Subscribe (pub/sub).
//!
//! Внутрипроцессная типизированная шина сообщений с приоритетами
//! обработчиков:
//!
//! - `handler`: обёртка пользовательского callback'а и его идентичность.
//! - `group` (приватный): обработчики с одинаковым порядком.
//! - `broker`: группы обработчиков одного типа сообщения и публикация.
//! - `scoped`: брокеры, разделённые по ключу области видимости.
//! - `hub`: реестр брокеров, индексированный типом сообщения.
//! - `cached`: издатель, удерживающий брокер одной области.
//! - `subscription`: дескрипторы подписок.
//! - `context`: контекст публикации и итоговый отчёт.
//! - `diagnostics`: приёмники ошибок брокера.
//! - `pool`: пулы буферов для снимков при публикации.

pub mod broker;
pub mod cached;
pub mod context;
pub mod diagnostics;
mod group;
pub mod handler;
pub mod hub;
pub mod pool;
pub mod scoped;
pub mod subscription;

// Публичный экспорт типов из вложенных модулей, чтобы упростить доступ к ним
// из внешнего кода.
pub use broker::*;
pub use cached::*;
pub use context::*;
pub use diagnostics::*;
pub use handler::*;
pub use hub::*;
pub use pool::{BufferPool, PoolStats, Pooled, SnapshotPools};
pub use scoped::*;
pub use subscription::{Subscription, SubscriptionBag};
