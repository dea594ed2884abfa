use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, registry::LookupSpan, Layer};

use crate::logging::config::{LogFormat, LoggingConfig};

/// Файловый слой с неблокирующей записью. Guard должен жить, пока нужны
/// логи: при его уничтожении буфер сбрасывается на диск.
pub fn layer_with_config<S>(
    config: &LoggingConfig
) -> (Box<dyn Layer<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let file = &config.file;
    let appender = if file.daily_rotation {
        rolling::daily(&config.log_dir, &file.filename)
    } else {
        rolling::never(&config.log_dir, &file.filename)
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let base = fmt::layer().with_ansi(false).with_writer(writer);
    let layer = match file.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };
    (layer, guard)
}
