//! Транспортный уровень: трейты соединений с брокерами, их реализации в
//! памяти процесса и драйверы реальных брокеров.
//!
//! Очередь сообщений зависит только от трейтов [`ExchangeDialer`] и
//! [`StreamDialer`]. Драйверы RabbitMQ и NATS включаются features `amqp` и
//! `nats`.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod exchange;
#[cfg(feature = "nats")]
pub mod nats;
pub mod stream;
pub mod topic;

#[cfg(feature = "amqp")]
pub use amqp::LapinDialer;
pub use exchange::{ExchangeChannel, ExchangeDialer, MemoryExchangeBroker};
#[cfg(feature = "nats")]
pub use nats::NatsDialer;
pub use stream::{MemoryStreamBroker, StreamDialer, StreamSession};
