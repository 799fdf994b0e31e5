use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::Layer as LayerTrait,
    registry::LookupSpan,
};

use crate::logging::config::{LogFormat, LoggingConfig};

/// Boxed fmt-слой в выбранном формате поверх произвольного writer'а.
///
/// Возвращаем trait-объект, чтобы стереть конкретный тип формата
/// (json/pretty/compact).
pub fn build_formatter_from_config<S, W>(
    config: &LoggingConfig,
    writer: W,
    with_ansi: bool,
) -> Box<dyn LayerTrait<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(with_ansi)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => Box::new(layer.json().with_current_span(true)),
        LogFormat::Pretty => Box::new(layer.pretty().with_span_events(FmtSpan::CLOSE)),
        LogFormat::Compact => Box::new(layer.compact()),
    }
}
