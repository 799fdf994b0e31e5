use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::{config::LoggingConfig, formatter};

/// Файловый слой с ежедневной ротацией и неблокирующей записью.
///
/// Guard нужно держать, пока пишутся логи: при его drop буфер сбрасывается.
pub fn layer_with_config<S>(
    config: &LoggingConfig
) -> (Box<dyn LayerTrait<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = rolling::daily(&config.log_dir, &config.file_prefix);
    let (writer, guard) = non_blocking(appender);

    let layer = formatter::build_formatter_from_config(config, writer, false);
    (layer, guard)
}
