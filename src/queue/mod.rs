//! Очередь сообщений: публикация, подписка, запрос–ответ и закрытие поверх
//! ненадёжного соединения с брокером.
//!
//! - `message`: [`Message`], [`Subscription`] и обработчики;
//! - `state`: [`ConnectionState`];
//! - `backend`: граница [`Backend`] между общей логикой и диалектом брокера;
//! - `connection`: менеджер соединения с переподключением;
//! - `registry`: реестр подписок и их потребителей;
//! - `consumer`: цикл обработки доставок;
//! - `client`: [`QueueClient`], реализация [`Queue`];
//! - `exchange`, `stream`: два бэкенда с одинаковым контрактом.

pub mod backend;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod exchange;
pub mod message;
pub mod registry;
pub mod state;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::{ErrorExt, LogLevel, QueueError};
use tracing::{debug, error, info, trace, warn};

pub use backend::{AckTiming, Backend, Delivery, DeliveryStream, ReplyInbox};
pub use client::QueueClient;
pub use connection::ClientOptions;
pub use exchange::ExchangeBackend;
pub use message::{FnHandler, Handler, Message, Subscription};
pub use state::ConnectionState;
pub use stream::StreamBackend;

use crate::telemetry::Context;

/// Пишет ошибку в лог с уровнем, который задаёт её статус-код.
pub(crate) fn log_queue_error(
    err: &QueueError,
    message: &str,
) {
    let code = err.status_code();
    let retryable = code.is_retryable();
    match code.log_level() {
        LogLevel::Trace => trace!(error = %err, %code, retryable, "{message}"),
        LogLevel::Debug => debug!(error = %err, %code, retryable, "{message}"),
        LogLevel::Info => info!(error = %err, %code, retryable, "{message}"),
        LogLevel::Warn => warn!(error = %err, %code, retryable, "{message}"),
        LogLevel::Error => error!(error = %err, %code, retryable, "{message}"),
    }
}

/// Клиент поверх брокера с моделью обменников и очередей.
pub type ExchangeQueue = QueueClient<ExchangeBackend>;
/// Клиент поверх потокового брокера.
pub type StreamQueue = QueueClient<StreamBackend>;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Публикует тело в топик с заголовками контекста трассы.
    ///
    /// Не буферизует и не повторяет: при недоступном соединении сразу
    /// возвращает [`QueueError::Publish`].
    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
        body: Bytes,
    ) -> Result<(), QueueError>;

    /// Публикует запрос и ждёт один ответ до дедлайна контекста, его отмены
    /// или верхней границы ожидания клиента.
    async fn request(
        &self,
        ctx: &Context,
        topic: &str,
        body: Bytes,
    ) -> Result<Bytes, QueueError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Регистрирует подписку. Повторная подписка на тот же топик создаёт
    /// независимого потребителя.
    async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Subscription,
    ) -> Result<(), QueueError>;
}

/// Полный контракт очереди.
#[async_trait]
pub trait Queue: Publisher + Subscriber {
    /// Останавливает потребителей и закрывает соединение. Повторный вызов
    /// ничего не делает.
    async fn close(&self) -> Result<(), QueueError>;
}
