use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Формат вывода событий.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// Конфигурация логирования.
///
/// Читается как секция `logging` в [`Settings`](crate::config::Settings);
/// любое поле можно опустить.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень для событий крейта (`trace`..`error`)
    pub level: String,
    /// Дополнительные директивы фильтра, например `tokio=warn`
    pub directives: Vec<String>,
    pub format: LogFormat,
    pub console_enabled: bool,
    pub with_ansi: bool,
    pub with_target: bool,
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    /// Префикс файлов с ежедневной ротацией
    pub file_prefix: String,
}

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            format: LogFormat::Compact,
            console_enabled: true,
            with_ansi: true,
            with_target: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            file_prefix: "courier.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        let level = self.level.to_ascii_lowercase();
        if !LEVELS.contains(&level.as_str()) {
            return Err(format!("unknown log level '{}'", self.level));
        }
        if self.file_enabled && self.file_prefix.is_empty() {
            return Err("file_prefix must not be empty when file logging is enabled".into());
        }
        Ok(())
    }

    /// Директива фильтра: уровень крейта плюс дополнительные директивы.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = vec![format!(
            "{}={}",
            env!("CARGO_CRATE_NAME"),
            self.level.to_ascii_lowercase()
        )];
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }

    pub fn ensure_log_dir(&self) -> io::Result<()> {
        if self.file_enabled {
            fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }
}
