use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::{Baggage, Context, SpanContext, SpanId};

/// Возможности span'а, которые использует слой обмена сообщениями.
pub trait Span: Send + Sync {
    /// Завершает span. Повторный вызов ничего не делает.
    fn end(&self);
    /// Записывает ошибку в span.
    fn record_error(
        &self,
        err: &dyn fmt::Display,
    );
    /// Добавляет атрибут ключ–значение.
    fn set_attribute(
        &self,
        key: &str,
        value: String,
    );
    /// Идентификаторы span'а.
    fn span_context(&self) -> SpanContext;
    /// Контекст, в котором этот span активен.
    fn context(
        &self,
        ctx: &Context,
    ) -> Context {
        ctx.with_span_context(self.span_context())
    }
}

pub type SpanRef = Arc<dyn Span>;

/// Снимок завершённого span'а.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSpan {
    pub name: String,
    pub service: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_us: u128,
}

/// Накопитель завершённых span'ов.
#[derive(Debug, Clone, Default)]
pub struct SpanRecorder {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
}

/// Span, который пишет события в `tracing` и (опционально) в [`SpanRecorder`].
pub struct RecordingSpan {
    name: String,
    service: Arc<str>,
    context: SpanContext,
    parent: Option<SpanId>,
    started_at: DateTime<Utc>,
    started: Instant,
    attributes: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<String>>,
    ended: AtomicBool,
    recorder: Option<SpanRecorder>,
}

/// Span удалённого родителя, восстановленный из заголовков.
///
/// Ничего не записывает; невалидный контекст означает «родителя нет».
#[derive(Debug, Clone, Default)]
pub struct NonRecordingSpan {
    context: SpanContext,
    baggage: Baggage,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SpanRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &self,
        span: FinishedSpan,
    ) {
        self.spans.lock().push(span);
    }

    /// Копия всех завершённых span'ов в порядке завершения.
    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.spans.lock().clone()
    }

    /// Завершённые span'ы с заданным именем.
    pub fn by_name(
        &self,
        name: &str,
    ) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl RecordingSpan {
    pub fn new(
        name: impl Into<String>,
        service: Arc<str>,
        context: SpanContext,
        parent: Option<SpanId>,
        recorder: Option<SpanRecorder>,
    ) -> Self {
        Self {
            name: name.into(),
            service,
            context,
            parent,
            started_at: Utc::now(),
            started: Instant::now(),
            attributes: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
            recorder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent
    }
}

impl Span for RecordingSpan {
    fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let duration = self.started.elapsed();
        let errors = self.errors.lock().clone();

        tracing::debug!(
            target: "courier::trace",
            service = %self.service,
            span = %self.name,
            trace_id = %self.context.trace_id,
            span_id = %self.context.span_id,
            parent_span_id = ?self.parent.map(|p| p.to_string()),
            duration_us = duration.as_micros() as u64,
            errors = errors.len(),
            "span finished"
        );

        if let Some(recorder) = &self.recorder {
            recorder.push(FinishedSpan {
                name: self.name.clone(),
                service: self.service.to_string(),
                trace_id: self.context.trace_id.to_string(),
                span_id: self.context.span_id.to_string(),
                parent_span_id: self.parent.map(|p| p.to_string()),
                attributes: self.attributes.lock().clone(),
                errors,
                started_at: self.started_at,
                duration_us: duration.as_micros(),
            });
        }
    }

    fn record_error(
        &self,
        err: &dyn fmt::Display,
    ) {
        let message = err.to_string();
        tracing::warn!(
            target: "courier::trace",
            span = %self.name,
            trace_id = %self.context.trace_id,
            error = %message,
            "span recorded error"
        );
        self.errors.lock().push(message);
    }

    fn set_attribute(
        &self,
        key: &str,
        value: String,
    ) {
        self.attributes.lock().push((key.to_string(), value));
    }

    fn span_context(&self) -> SpanContext {
        self.context.clone()
    }
}

impl Drop for RecordingSpan {
    fn drop(&mut self) {
        // span, который забыли завершить, всё равно попадает в запись
        self.end();
    }
}

impl NonRecordingSpan {
    pub fn new(
        context: SpanContext,
        baggage: Baggage,
    ) -> Self {
        Self { context, baggage }
    }

    /// Span без родителя: невалидный контекст, пустой baggage.
    pub fn parentless() -> Self {
        Self::default()
    }
}

impl Span for NonRecordingSpan {
    fn end(&self) {}

    fn record_error(
        &self,
        _err: &dyn fmt::Display,
    ) {
    }

    fn set_attribute(
        &self,
        _key: &str,
        _value: String,
    ) {
    }

    fn span_context(&self) -> SpanContext {
        self.context.clone()
    }

    fn context(
        &self,
        ctx: &Context,
    ) -> Context {
        ctx.with_span_context(self.context.clone())
            .with_baggage(&self.baggage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(recorder: &SpanRecorder) -> RecordingSpan {
        RecordingSpan::new(
            "queue.consume",
            Arc::from("orders"),
            SpanContext::new_root(),
            None,
            Some(recorder.clone()),
        )
    }

    /// Тест проверяет, что повторный `end` не дублирует запись.
    #[test]
    fn test_end_is_idempotent() {
        let recorder = SpanRecorder::new();
        let s = span(&recorder);
        s.end();
        s.end();
        drop(s);
        assert_eq!(recorder.finished().len(), 1);
    }

    #[test]
    fn test_errors_and_attributes_are_recorded() {
        let recorder = SpanRecorder::new();
        let s = span(&recorder);
        s.set_attribute("topic", "orders.ready".into());
        s.record_error(&"boom");
        s.end();

        let finished = recorder.by_name("queue.consume");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].errors, vec!["boom".to_string()]);
        assert_eq!(
            finished[0].attributes,
            vec![("topic".to_string(), "orders.ready".to_string())]
        );
        assert_eq!(finished[0].service, "orders");
    }

    /// Тест проверяет, что span без родителя даёт контекст без активного span'а.
    #[test]
    fn test_parentless_span_context() {
        let parent = NonRecordingSpan::parentless();
        assert!(!parent.span_context().is_valid());
        let ctx = parent.context(&Context::background());
        assert!(ctx.span_context().is_none());
    }

    #[test]
    fn test_non_recording_span_carries_baggage() {
        let mut baggage = Baggage::new();
        baggage.insert("tenant".into(), "acme".into());
        let parent = NonRecordingSpan::new(SpanContext::new_root(), baggage);
        let ctx = parent.context(&Context::background());
        assert_eq!(ctx.baggage().get("tenant").map(String::as_str), Some("acme"));
    }
}
