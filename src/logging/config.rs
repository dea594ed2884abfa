use std::{env, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Формат вывода событий.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Настройки консольного вывода.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
}

/// Настройки вывода в файл (через `tracing-appender`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub format: LogFormat,
    pub filename: String,
    /// Ротация раз в сутки; иначе один файл.
    pub daily_rotation: bool,
}

/// Настройки логирования.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень по умолчанию или полная директива `EnvFilter`.
    pub level: String,
    /// Дополнительные директивы для отдельных модулей.
    pub directives: Vec<String>,
    pub log_dir: PathBuf,
    pub console_enabled: bool,
    pub console: ConsoleConfig,
    pub file_enabled: bool,
    pub file: FileConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            with_ansi: true,
            with_target: true,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filename: "mercury.log".to_string(),
            daily_rotation: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            log_dir: PathBuf::from("logs"),
            console_enabled: true,
            console: ConsoleConfig::default(),
            file_enabled: false,
            file: FileConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Применяет переменные окружения `MERCURY_LOG_*`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("MERCURY_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(dir) = env::var("MERCURY_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
            self.file_enabled = true;
        }
        if let Ok(format) = env::var("MERCURY_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "pretty" => self.console.format = LogFormat::Pretty,
                "compact" => self.console.format = LogFormat::Compact,
                "json" => self.console.format = LogFormat::Json,
                _ => {}
            }
        }
        if env::var_os("NO_COLOR").is_some() {
            self.console.with_ansi = false;
        }
    }

    /// Директива для `EnvFilter`: уровень и модульные директивы через запятую.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = vec![self.level.clone()];
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::invalid("level", "must not be empty"));
        }
        EnvFilter::try_new(self.build_filter_directive())
            .map_err(|e| ConfigError::invalid("level", e.to_string()))?;

        if self.file_enabled && self.file.filename.trim().is_empty() {
            return Err(ConfigError::invalid("file.filename", "must not be empty"));
        }
        Ok(())
    }

    /// Создаёт каталог логов, если включён вывод в файл.
    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        if self.file_enabled {
            std::fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }
}
