//! Логирование через `tracing-subscriber`: фильтр, консоль и файл.

pub mod config;
mod filters;
mod formatter;
pub mod handle;
pub mod sinks;

pub use config::{LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type FilteredRegistry = Layered<EnvFilter, Registry>;

/// Инициализация логирования с конфигурацией.
///
/// Устанавливает глобальный subscriber; повторный вызов возвращает ошибку.
pub fn init_logging(
    config: LoggingConfig
) -> Result<LoggingHandle, Box<dyn std::error::Error + Send + Sync>> {
    config.validate()?;
    config.ensure_log_dir()?;

    let env_filter = filters::build_filter_from_config(&config);
    let mut layers: Vec<Box<dyn Layer<FilteredRegistry> + Send + Sync>> = Vec::new();

    // Console layer
    if config.console_enabled {
        layers.push(sinks::console::layer_with_config(&config));
    }

    // File layer
    let file_guard = if config.file_enabled {
        let (file_layer, guard) = sinks::file::layer_with_config(&config);
        layers.push(file_layer);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format,
        log_dir = %config.log_dir.display(),
        console_enabled = config.console_enabled,
        file_enabled = config.file_enabled,
        "Logging system initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что файловый слой создаёт каталог и пишет в него.
    ///
    /// Глобальный subscriber ставится один раз на процесс, поэтому
    /// `init_logging` вызывается только в этом тесте.
    #[test]
    fn test_init_logging_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested");
        let config = LoggingConfig {
            level: "debug".into(),
            console_enabled: false,
            file_enabled: true,
            log_dir: log_dir.clone(),
            ..Default::default()
        };

        let handle = init_logging(config.clone()).unwrap();
        assert!(handle.has_file_writer());
        tracing::info!(topic = "orders.ready", "file sink smoke test");
        handle.shutdown();

        let files: Vec<_> = std::fs::read_dir(&log_dir).unwrap().collect();
        assert!(!files.is_empty());

        // второй глобальный subscriber не ставится
        assert!(init_logging(config).is_err());
    }

    #[test]
    fn test_init_logging_rejects_invalid_config() {
        let config = LoggingConfig {
            level: "chatty".into(),
            ..Default::default()
        };
        assert!(init_logging(config).is_err());
    }
}
