//! Resilient publish/subscribe and request/reply over unreliable broker
//! connections, with W3C trace-context propagation through message headers.

/// Broker dialer traits, in-process brokers and the optional RabbitMQ / NATS drivers.
pub mod broker;
/// Settings loading: defaults, optional file, `COURIER_*` environment.
pub mod config;
/// Error taxonomy (re-exported from `courier-error`) and settings errors.
pub mod error;
/// Logging setup (filters, formats, console and file sinks).
pub mod logging;
/// Queue facade: connection manager, subscriptions, consumers, backends.
pub mod queue;
/// Trace context, spans, tracers and carriers.
pub mod telemetry;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// In-process brokers.
pub use broker::{MemoryExchangeBroker, MemoryStreamBroker};
/// Settings.
pub use config::{BackendKind, ExchangeSettings, Settings, StreamSettings};
/// Errors.
pub use error::{ErrorExt, QueueError, SettingsError, StatusCode, TransportError};
/// Logging.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Queue API.
pub use queue::{
    AckTiming, ClientOptions, ConnectionState, ExchangeBackend, ExchangeQueue, Handler, Message,
    Publisher, Queue, QueueClient, StreamBackend, StreamQueue, Subscriber, Subscription,
};
/// Telemetry.
pub use telemetry::{
    Context, MapCarrier, NoopTracer, Span, SpanRecorder, SpanRef, TextMapCarrier,
    TraceContextTracer, Tracer,
};
