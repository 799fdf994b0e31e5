//! Трассировка: контекст выполнения, span'ы и распространение контекста.
//!
//! - `context`: [`Context`] — активный span, baggage, дедлайн и отмена.
//! - `carrier`: [`TextMapCarrier`] — мост ключ–значение к заголовкам брокера.
//! - `propagation`: форматы W3C `traceparent` / `baggage`.
//! - `span`: возможности span'а и их реализации.
//! - `tracer`: [`Tracer`] и его реализации.

pub mod carrier;
pub mod context;
pub mod propagation;
pub mod span;
pub mod tracer;

pub use carrier::*;
pub use context::*;
pub use span::*;
pub use tracer::*;
