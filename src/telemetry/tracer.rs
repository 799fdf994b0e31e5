use std::sync::Arc;

use super::{
    propagation, Context, NonRecordingSpan, RecordingSpan, SpanContext, SpanRecorder, SpanRef,
    TextMapCarrier,
};

/// Возможности трассировщика, которые получает очередь при создании.
pub trait Tracer: Send + Sync {
    /// Новый span от активного span'а контекста (или корневой).
    fn start_from_context(
        &self,
        ctx: &Context,
        name: &str,
    ) -> (Context, SpanRef);

    /// Новый дочерний span от заданного span'а.
    fn start_from_span(
        &self,
        ctx: &Context,
        span: &SpanRef,
        name: &str,
    ) -> (Context, SpanRef) {
        self.start_from_context(&span.context(ctx), name)
    }

    /// Записывает контекст трассы в носитель.
    fn inject(
        &self,
        ctx: &Context,
        carrier: &mut dyn TextMapCarrier,
    );

    /// Восстанавливает удалённого родителя из носителя.
    ///
    /// Отсутствующие или повреждённые заголовки дают span без родителя.
    fn extract(
        &self,
        ctx: &Context,
        carrier: &dyn TextMapCarrier,
    ) -> SpanRef;

    /// Сбрасывает буферы и завершает работу.
    fn shutdown(&self) {}
}

/// Трассировщик W3C Trace Context.
///
/// Имя сервиса служит именем ресурса каждого span'а. Завершённые span'ы
/// пишутся в `tracing` и, если задан, в [`SpanRecorder`].
#[derive(Debug, Clone)]
pub struct TraceContextTracer {
    service: Arc<str>,
    recorder: Option<SpanRecorder>,
}

/// Трассировщик, который ничего не записывает, но честно распространяет
/// входящий контекст.
#[derive(Debug, Clone, Default)]
pub struct NoopTracer;

impl TraceContextTracer {
    pub fn new(service: impl AsRef<str>) -> Self {
        Self {
            service: Arc::from(service.as_ref()),
            recorder: None,
        }
    }

    pub fn with_recorder(
        mut self,
        recorder: SpanRecorder,
    ) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Tracer for TraceContextTracer {
    fn start_from_context(
        &self,
        ctx: &Context,
        name: &str,
    ) -> (Context, SpanRef) {
        let (span_ctx, parent) = match ctx.span_context() {
            Some(parent) => (parent.child(), Some(parent.span_id)),
            None => (SpanContext::new_root(), None),
        };

        let span = RecordingSpan::new(
            name,
            self.service.clone(),
            span_ctx.clone(),
            parent,
            self.recorder.clone(),
        );

        (ctx.with_span_context(span_ctx), Arc::new(span))
    }

    fn inject(
        &self,
        ctx: &Context,
        carrier: &mut dyn TextMapCarrier,
    ) {
        propagation::inject(ctx, carrier);
    }

    fn extract(
        &self,
        _ctx: &Context,
        carrier: &dyn TextMapCarrier,
    ) -> SpanRef {
        let baggage = propagation::extract_baggage(carrier);
        match propagation::extract_span_context(carrier) {
            Some(remote) => Arc::new(NonRecordingSpan::new(remote, baggage)),
            None => {
                if carrier.get(propagation::TRACEPARENT_HEADER).is_some() {
                    tracing::debug!(
                        target: "courier::trace",
                        service = %self.service,
                        "malformed traceparent header ignored"
                    );
                }
                Arc::new(NonRecordingSpan::new(SpanContext::default(), baggage))
            }
        }
    }

    fn shutdown(&self) {
        tracing::info!(service = %self.service, "tracer shut down");
    }
}

impl Tracer for NoopTracer {
    fn start_from_context(
        &self,
        ctx: &Context,
        _name: &str,
    ) -> (Context, SpanRef) {
        let span = NonRecordingSpan::new(
            ctx.span_context().cloned().unwrap_or_default(),
            Default::default(),
        );
        (ctx.clone(), Arc::new(span))
    }

    fn inject(
        &self,
        ctx: &Context,
        carrier: &mut dyn TextMapCarrier,
    ) {
        propagation::inject(ctx, carrier);
    }

    fn extract(
        &self,
        _ctx: &Context,
        carrier: &dyn TextMapCarrier,
    ) -> SpanRef {
        match propagation::extract_span_context(carrier) {
            Some(remote) => Arc::new(NonRecordingSpan::new(
                remote,
                propagation::extract_baggage(carrier),
            )),
            None => Arc::new(NonRecordingSpan::parentless()),
        }
    }
}
