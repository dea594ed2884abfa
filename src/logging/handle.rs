use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;

/// Управляет временем жизни неблокирующих писателей.
///
/// Пока handle жив, фоновый поток файлового писателя работает. Буфер
/// сбрасывается при освобождении guard, поэтому перед завершением процесса
/// вызовите [`LoggingHandle::shutdown`] или
/// [`LoggingHandle::shutdown_async`].
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self { file_guard }
    }

    pub fn has_file_writer(&self) -> bool {
        self.file_guard.is_some()
    }

    /// Завершает логирование. Блокирует поток, пока файловый писатель не
    /// сбросит буфер.
    pub fn shutdown(mut self) {
        tracing::info!(
            file_writer = self.has_file_writer(),
            "Logging shutdown initiated"
        );
        drop(self.file_guard.take());
    }

    /// Асинхронный вариант [`LoggingHandle::shutdown`]. Guard освобождается
    /// в блокирующем потоке; ожидание ограничено `timeout`, после чего
    /// сброс продолжается в фоне.
    pub async fn shutdown_async(
        mut self,
        timeout: Duration,
    ) {
        let guard = self.file_guard.take();

        let flushed = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || drop(guard)),
        )
        .await;

        match flushed {
            Ok(Ok(())) => tracing::info!("Logging shutdown completed"),
            Ok(Err(e)) => eprintln!("Logging shutdown task failed: {e}"),
            Err(_) => eprintln!(
                "WARNING: logging shutdown exceeded timeout of {}ms",
                timeout.as_millis()
            ),
        }
    }
}

impl Drop for LoggingHandle {
    fn drop(&mut self) {
        if self.file_guard.is_some() {
            eprintln!(
                "WARNING: LoggingHandle dropped without shutdown(); \
                 buffered log lines are flushed on a best-effort basis"
            );
        }
    }
}
