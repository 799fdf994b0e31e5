use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};

/// 128-битный идентификатор трассы.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId(pub u128);

/// 64-битный идентификатор span'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(pub u64);

/// Неизменяемая часть span'а, которая пересекает границы процессов.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Флаг `sampled` из `traceparent`
    pub sampled: bool,
    /// Контекст получен из заголовков другого процесса
    pub remote: bool,
    /// Значение `tracestate`, передаётся как есть
    pub trace_state: String,
}

/// Пары ключ–значение, которые путешествуют вместе с трассой.
pub type Baggage = BTreeMap<String, String>;

/// Контекст выполнения операции.
///
/// Несёт активный span, baggage, необязательный дедлайн и сигнал отмены.
/// Клонирование дешёвое: сигнал отмены разделяется между копиями.
#[derive(Clone, Default)]
pub struct Context {
    span: Option<SpanContext>,
    baggage: Arc<Baggage>,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Ручка отмены, выданная [`Context::with_cancel`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    /// Генерирует случайный ненулевой идентификатор.
    pub fn random() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return TraceId(id);
            }
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(TraceId)
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    /// Генерирует случайный ненулевой идентификатор.
    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return SpanId(id);
            }
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(SpanId)
    }
}

impl fmt::Display for TraceId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl SpanContext {
    /// Новый корневой контекст со свежими идентификаторами.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            sampled: true,
            remote: false,
            trace_state: String::new(),
        }
    }

    /// Дочерний контекст: та же трасса, новый span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            sampled: self.sampled,
            remote: false,
            trace_state: self.trace_state.clone(),
        }
    }

    /// Контекст валиден, если оба идентификатора ненулевые.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }
}

impl Context {
    /// Пустой корневой контекст без span'а, дедлайна и отмены.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    /// Копия контекста с другим активным span'ом.
    ///
    /// Невалидный span-контекст очищает активный span.
    pub fn with_span_context(
        &self,
        span: SpanContext,
    ) -> Self {
        let mut ctx = self.clone();
        ctx.span = span.is_valid().then_some(span);
        ctx
    }

    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    pub fn with_baggage_item(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut ctx = self.clone();
        Arc::make_mut(&mut ctx.baggage).insert(key.into(), value.into());
        ctx
    }

    /// Копия контекста, в которую добавлены все элементы `baggage`.
    pub fn with_baggage(
        &self,
        baggage: &Baggage,
    ) -> Self {
        if baggage.is_empty() {
            return self.clone();
        }
        let mut ctx = self.clone();
        let merged = Arc::make_mut(&mut ctx.baggage);
        for (k, v) in baggage {
            merged.insert(k.clone(), v.clone());
        }
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Устанавливает дедлайн; более ранний существующий дедлайн сохраняется.
    pub fn with_deadline(
        &self,
        deadline: Instant,
    ) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    pub fn with_timeout(
        &self,
        timeout: Duration,
    ) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Копия контекста с собственным сигналом отмены.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut ctx = self.clone();
        ctx.cancel = Some(rx);
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Завершается, когда контекст отменён.
    ///
    /// Для контекста без сигнала отмены (или если ручка отмены уничтожена без
    /// вызова `cancel`) никогда не завершается.
    pub async fn cancelled(&self) {
        let Some(mut rx) = self.cancel.clone() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span)
            .field("baggage", &self.baggage)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}
