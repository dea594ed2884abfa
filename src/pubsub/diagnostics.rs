use std::fmt;

use mercury_error::{ErrorExt, LogLevel};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::BrokerError;

/// Приёмник ошибок брокера.
///
/// Ошибки доставки и жизненного цикла никогда не пробрасываются публикатору:
/// они передаются сюда. Реализация обязана быть потокобезопасной и не должна
/// паниковать.
pub trait Diagnostics: Send + Sync + 'static {
    fn report(
        &self,
        error: &BrokerError,
    );
}

/// Приёмник по умолчанию: пишет событие `tracing` с уровнем, выбранным по
/// коду статуса ошибки.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

/// Приёмник, накапливающий ошибки в памяти.
#[derive(Default)]
pub struct MemoryDiagnostics {
    errors: Mutex<Vec<BrokerError>>,
}

impl Diagnostics for TracingDiagnostics {
    fn report(
        &self,
        err: &BrokerError,
    ) {
        let status = err.status_code();
        let kind = err.type_name();
        let caller = status.is_caller_error();
        match status.log_level() {
            LogLevel::Trace => trace!(%status, kind, caller, "{err}"),
            LogLevel::Debug => debug!(%status, kind, caller, "{err}"),
            LogLevel::Info => info!(%status, kind, caller, "{err}"),
            LogLevel::Warn => warn!(%status, kind, caller, "{err}"),
            LogLevel::Error => error!(%status, kind, caller, "{err}"),
        }
    }
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Копия всех накопленных ошибок.
    pub fn errors(&self) -> Vec<BrokerError> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Забирает накопленные ошибки, оставляя приёмник пустым.
    pub fn take(&self) -> Vec<BrokerError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn report(
        &self,
        error: &BrokerError,
    ) {
        self.errors.lock().push(error.clone());
    }
}

impl fmt::Debug for MemoryDiagnostics {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("MemoryDiagnostics")
            .field("errors", &self.len())
            .finish()
    }
}

/// Любое замыкание `Fn(&BrokerError)` может служить приёмником.
impl<F> Diagnostics for F
where
    F: Fn(&BrokerError) + Send + Sync + 'static,
{
    fn report(
        &self,
        error: &BrokerError,
    ) {
        self(error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn no_subscriber() -> BrokerError {
        BrokerError::NoSubscriber {
            message_type: "u32",
        }
    }

    /// Тест проверяет накопление и извлечение ошибок.
    #[test]
    fn test_memory_diagnostics_collects() {
        let sink = MemoryDiagnostics::new();
        assert!(sink.is_empty());

        sink.report(&no_subscriber());
        sink.report(&no_subscriber());
        assert_eq!(sink.len(), 2);

        let taken = sink.take();
        assert_eq!(taken.len(), 2);
        assert!(sink.is_empty());
    }

    /// Тест проверяет, что замыкание работает как приёмник.
    #[test]
    fn test_closure_sink() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sink: Arc<dyn Diagnostics> = Arc::new(move |_: &BrokerError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.report(&no_subscriber());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// Тест проверяет, что tracing-приёмник не паникует без подписчика.
    #[test]
    fn test_tracing_sink_without_subscriber() {
        TracingDiagnostics.report(&no_subscriber());
        TracingDiagnostics.report(&BrokerError::UnbalancedUncache {
            message_type: "u32",
        });
    }
}
