use std::io::{self, Stdout};

use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::{config::LoggingConfig, formatter};

/// Консольный слой в stdout.
pub fn layer_with_config<S>(config: &LoggingConfig) -> Box<dyn LayerTrait<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let writer: fn() -> Stdout = io::stdout;
    formatter::build_formatter_from_config(config, writer, config.with_ansi)
}

#[cfg(test)]
mod tests {
    use tracing::info;
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;
    use crate::logging::config::LogFormat;

    /// Тест проверяет, что слой строится и пишет во всех форматах без
    /// паники.
    #[test]
    fn test_layer_for_every_format() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let config = LoggingConfig {
                format,
                with_ansi: false,
                ..Default::default()
            };
            let subscriber = Registry::default().with(layer_with_config(&config));
            tracing::subscriber::with_default(subscriber, || {
                info!(topic = "orders.ready", "console smoke test");
            });
        }
    }
}
