use std::any::Any;

use mercury_error::{ErrorExt, StatusCode};
use thiserror::Error;

use crate::pubsub::HandlerId;

/// Ошибки брокера, передаваемые в приёмник диагностики.
///
/// Публикатор их не получает: доставка продолжается, а ошибка
/// регистрируется через [`Diagnostics`](crate::pubsub::Diagnostics).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("handler {handler} is already subscribed to `{message_type}` at order {order}")]
    DuplicateHandler {
        handler: HandlerId,
        order: i32,
        message_type: &'static str,
    },

    #[error("broker for `{message_type}` is disposed")]
    Disposed { message_type: &'static str },

    #[error("handler {handler} for `{message_type}` (order {order}) failed: {reason}")]
    HandlerFailed {
        handler: HandlerId,
        order: i32,
        message_type: &'static str,
        reason: String,
    },

    #[error("handler {handler} for `{message_type}` (order {order}) panicked: {reason}")]
    HandlerPanicked {
        handler: HandlerId,
        order: i32,
        message_type: &'static str,
        reason: String,
    },

    #[error("no subscriber registered for `{message_type}`")]
    NoSubscriber { message_type: &'static str },

    #[error("uncache without matching cache on `{message_type}` broker")]
    UnbalancedUncache { message_type: &'static str },
}

/// Ошибки API хаба, возвращаемые вызывающему коду.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("cached publisher for `{message_type}` is disposed")]
    Disposed { message_type: &'static str },

    #[error("cached publisher for `{message_type}` has no message factory")]
    MissingFactory { message_type: &'static str },
}

impl BrokerError {
    /// Тип сообщения, к которому относится ошибка.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::DuplicateHandler { message_type, .. }
            | Self::Disposed { message_type }
            | Self::HandlerFailed { message_type, .. }
            | Self::HandlerPanicked { message_type, .. }
            | Self::NoSubscriber { message_type }
            | Self::UnbalancedUncache { message_type } => message_type,
        }
    }

    /// Обработчик, вызвавший ошибку, если он известен.
    pub fn handler(&self) -> Option<HandlerId> {
        match self {
            Self::DuplicateHandler { handler, .. }
            | Self::HandlerFailed { handler, .. }
            | Self::HandlerPanicked { handler, .. } => Some(*handler),
            _ => None,
        }
    }
}

impl ErrorExt for BrokerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateHandler { .. } => StatusCode::DuplicateHandler,
            Self::Disposed { .. } => StatusCode::BrokerDisposed,
            Self::HandlerFailed { .. } => StatusCode::HandlerFailed,
            Self::HandlerPanicked { .. } => StatusCode::HandlerPanicked,
            Self::NoSubscriber { .. } => StatusCode::NoSubscriber,
            Self::UnbalancedUncache { .. } => StatusCode::UnbalancedUncache,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("error_type", self.type_name()),
            ("status_code", self.status_code().to_string()),
            ("message_type", self.message_type().to_string()),
        ]
    }
}

impl ErrorExt for HubError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Disposed { .. } => StatusCode::PublisherDisposed,
            Self::MissingFactory { .. } => StatusCode::MissingFactory,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
