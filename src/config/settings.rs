use std::{path::Path, time::Duration};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, pubsub::PriorityOrder};

/// Настройки [`MessageHub`](crate::pubsub::MessageHub).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Направление обхода групп приоритета.
    pub priority_order: PriorityOrder,
    /// Сообщать в диагностику, если публикация не нашла подписчиков.
    pub warn_if_no_subscriber: bool,
    /// Интервал повторной проверки регистрации при
    /// `PublishStrategy::WaitForSubscriber`, в миллисекундах.
    pub wait_poll_interval_ms: u64,
    /// Сколько буферов каждого класса ёмкости хранит пул.
    pub pool_max_buffers: usize,
    /// Буферы большей ёмкости в пул не возвращаются.
    pub pool_max_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            priority_order: PriorityOrder::Ascending,
            warn_if_no_subscriber: false,
            wait_poll_interval_ms: 10,
            pool_max_buffers: 16,
            pool_max_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Загружает настройки из переменных окружения с префиксом `MERCURY_`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Загружает настройки из файла (если задан) и переменных окружения.
    /// Переменные окружения имеют приоритет.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            // Значения по умолчанию
            .set_default("priority_order", "ascending")?
            .set_default("warn_if_no_subscriber", defaults.warn_if_no_subscriber)?
            .set_default("wait_poll_interval_ms", defaults.wait_poll_interval_ms)?
            .set_default("pool_max_buffers", defaults.pool_max_buffers as u64)?
            .set_default("pool_max_capacity", defaults.pool_max_capacity as u64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let cfg = builder
            // Переменные окружения с префиксом MERCURY_
            .add_source(Environment::with_prefix("MERCURY").try_parsing(true))
            .build()?;

        let settings: Self = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Проверяет значения, которые нельзя выразить типом.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "wait_poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.pool_max_buffers == 0 {
            return Err(ConfigError::invalid(
                "pool_max_buffers",
                "must be greater than zero",
            ));
        }
        if self.pool_max_capacity == 0 {
            return Err(ConfigError::invalid(
                "pool_max_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}
