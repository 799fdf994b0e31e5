//! W3C Trace Context и W3C Baggage поверх [`TextMapCarrier`].
//!
//! Формат `traceparent`: `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
//! Нулевые идентификаторы и неизвестные версии считаются некорректными.

use super::{Baggage, Context, SpanContext, SpanId, TextMapCarrier, TraceId};

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const BAGGAGE_HEADER: &str = "baggage";

const SUPPORTED_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

/// Записывает активный span и baggage контекста в носитель.
///
/// Контекст без валидного span'а пишет только baggage.
pub fn inject(
    ctx: &Context,
    carrier: &mut dyn TextMapCarrier,
) {
    if let Some(span) = ctx.span_context().filter(|s| s.is_valid()) {
        carrier.set(TRACEPARENT_HEADER, format_traceparent(span));
        if !span.trace_state.is_empty() {
            carrier.set(TRACESTATE_HEADER, span.trace_state.clone());
        }
    }

    if !ctx.baggage().is_empty() {
        carrier.set(BAGGAGE_HEADER, format_baggage(ctx.baggage()));
    }
}

/// Читает удалённый span-контекст; `None`, если заголовок отсутствует или
/// повреждён.
pub fn extract_span_context(carrier: &dyn TextMapCarrier) -> Option<SpanContext> {
    let mut span = parse_traceparent(carrier.get(TRACEPARENT_HEADER)?)?;
    if let Some(state) = carrier.get(TRACESTATE_HEADER) {
        span.trace_state = state.trim().to_string();
    }
    Some(span)
}

/// Читает baggage; некорректные элементы пропускаются.
pub fn extract_baggage(carrier: &dyn TextMapCarrier) -> Baggage {
    carrier
        .get(BAGGAGE_HEADER)
        .map(parse_baggage)
        .unwrap_or_default()
}

pub fn format_traceparent(span: &SpanContext) -> String {
    let flags = if span.sampled { FLAG_SAMPLED } else { 0 };
    format!(
        "{SUPPORTED_VERSION}-{}-{}-{flags:02x}",
        span.trace_id, span.span_id
    )
}

pub fn parse_traceparent(value: &str) -> Option<SpanContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = TraceId::from_hex(parts.next()?)?;
    let span_id = SpanId::from_hex(parts.next()?)?;
    let flags = parts.next()?;
    if parts.next().is_some() || version != SUPPORTED_VERSION || flags.len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;

    let span = SpanContext {
        trace_id,
        span_id,
        sampled: flags & FLAG_SAMPLED != 0,
        remote: true,
        trace_state: String::new(),
    };
    span.is_valid().then_some(span)
}

pub fn format_baggage(baggage: &Baggage) -> String {
    baggage
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_baggage(value: &str) -> Baggage {
    value
        .split(',')
        .filter_map(|member| {
            // свойства после ';' не поддерживаются и отбрасываются
            let pair = member.split(';').next()?;
            let (key, val) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), val.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MapCarrier;

    const SAMPLE: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_parse_known_traceparent() {
        let span = parse_traceparent(SAMPLE).expect("valid header");
        assert_eq!(span.trace_id, TraceId(0x4bf92f3577b34da6a3ce929d0e0e4736));
        assert_eq!(span.span_id, SpanId(0x00f067aa0ba902b7));
        assert!(span.sampled);
        assert!(span.remote);
        assert_eq!(format_traceparent(&span), SAMPLE);
    }

    /// Тест проверяет, что повреждённые заголовки отбрасываются.
    #[test]
    fn test_rejects_malformed_traceparent() {
        let cases = [
            "",
            "garbage",
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4bf92f3577b34da6a3ce929d0e0e473-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-1",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ];
        for case in cases {
            assert!(parse_traceparent(case).is_none(), "accepted {case:?}");
        }
    }

    #[test]
    fn test_inject_writes_headers() {
        let span = SpanContext {
            trace_state: "vendor=1".into(),
            ..SpanContext::new_root()
        };
        let ctx = Context::background()
            .with_span_context(span.clone())
            .with_baggage_item("tenant", "acme");

        let mut carrier = MapCarrier::new();
        inject(&ctx, &mut carrier);

        assert_eq!(
            carrier.get(TRACEPARENT_HEADER),
            Some(format_traceparent(&span).as_str())
        );
        assert_eq!(carrier.get(TRACESTATE_HEADER), Some("vendor=1"));
        assert_eq!(carrier.get(BAGGAGE_HEADER), Some("tenant=acme"));

        let extracted = extract_span_context(&carrier).unwrap();
        assert_eq!(extracted.trace_id, span.trace_id);
        assert_eq!(extracted.trace_state, "vendor=1");
    }

    #[test]
    fn test_inject_without_span_is_noop() {
        let mut carrier = MapCarrier::new();
        inject(&Context::background(), &mut carrier);
        assert!(carrier.keys().is_empty());
    }

    #[test]
    fn test_parse_baggage_skips_invalid_members() {
        let baggage = parse_baggage("a=1, b = 2 ;prop=x,=nokey,novalue, c=");
        assert_eq!(baggage.get("a").map(String::as_str), Some("1"));
        assert_eq!(baggage.get("b").map(String::as_str), Some("2"));
        assert_eq!(baggage.get("c").map(String::as_str), Some(""));
        assert_eq!(baggage.len(), 3);
    }
}
