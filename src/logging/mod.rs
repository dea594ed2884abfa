//! Инициализация `tracing` для процессов, использующих шину.
//!
//! Библиотека сама подписчика не устанавливает: события брокера
//! (`mercury::pubsub`) уходят в тот подписчик, который настроило
//! приложение. [`init_logging`] собирает стандартный вариант: фильтр
//! `EnvFilter`, консольный слой и, по желанию, файловый.

pub mod config;
mod filters;
pub mod handle;
pub mod sinks;

pub use config::{ConsoleConfig, FileConfig, LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Устанавливает глобальный подписчик по настройкам.
///
/// Возвращает ошибку, если настройки некорректны или глобальный
/// подписчик уже установлен.
pub fn init_logging(
    mut config: LoggingConfig
) -> Result<LoggingHandle, Box<dyn std::error::Error + Send + Sync>> {
    config.apply_env_overrides();
    config.validate()?;
    config.ensure_log_dir()?;

    let env_filter = filters::build_filter_from_config(&config);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_enabled {
        layers.push(sinks::console::layer_with_config(&config));
    }

    let file_guard = if config.file_enabled {
        let (file_layer, guard) = sinks::file::layer_with_config(&config);
        layers.push(file_layer);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        console_enabled = config.console_enabled,
        file_enabled = config.file_enabled,
        "Logging system initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}
