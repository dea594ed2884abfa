use tracing_subscriber::{fmt, registry::LookupSpan, Layer};

use crate::logging::config::{LogFormat, LoggingConfig};

/// Консольный слой с форматом из настроек.
pub fn layer_with_config<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let console = &config.console;
    let base = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(console.with_ansi)
        .with_target(console.with_target);

    match console.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use tracing::info;
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;

    /// Тест проверяет, что слой строится для всех форматов и принимает
    /// события без паники.
    #[test]
    fn test_layer_for_every_format() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let mut cfg = LoggingConfig::default();
            cfg.console.format = format;
            cfg.console.with_ansi = false;

            let subscriber = Registry::default().with(layer_with_config::<Registry>(&cfg));
            tracing::subscriber::with_default(subscriber, || {
                info!(?format, "console layer smoke test");
            });
        }
    }
}
