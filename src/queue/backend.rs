//! Граница между общей логикой очереди и конкретным диалектом брокера.
//!
//! [`Backend`] отвечает за соединение, топологию, публикацию и открытие
//! потоков доставки. Переподключение, реестр подписок, циклы потребителей и
//! запрос–ответ живут в общем коде и работают с любым бэкендом.

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::{QueueError, TransportError};
use serde::{Deserialize, Serialize};

use super::Message;
use crate::telemetry::{Context, TextMapCarrier, Tracer};

/// Момент подтверждения доставки относительно вызова обработчика.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckTiming {
    /// Подтверждать до вызова обработчика
    #[default]
    BeforeCallback,
    /// Подтверждать после возврата обработчика, в том числе с ошибкой
    AfterCallback,
    /// Брокер подтверждает сам
    Never,
}

/// Одна доставка с заголовками и способом подтверждения.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn message(&self) -> Message;

    /// Нативные заголовки доставки в виде носителя контекста.
    fn headers(&self) -> &dyn TextMapCarrier;

    async fn ack(&self) -> Result<(), TransportError>;
}

/// Поток доставок одного потребителя.
///
/// `None` означает, что брокер закрыл потребителя или соединение.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<Box<dyn Delivery>>;

    fn ack_timing(&self) -> AckTiming;
}

/// Временный адрес для ответов на один запрос.
pub struct ReplyInbox {
    /// Адрес, который уходит в `reply_to` запроса
    pub address: String,
    /// Идентификатор подписки на адрес у брокера
    pub token: String,
    pub deliveries: Box<dyn DeliveryStream>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Живое соединение. Дешёвый клон, разделяемый задачами.
    type Handle: Clone + Send + Sync + 'static;

    /// Короткое имя диалекта для логов и span'ов.
    fn kind(&self) -> &'static str;

    /// Устанавливает соединение и объявляет базовую топологию.
    async fn connect(&self) -> Result<Self::Handle, QueueError>;

    /// Завершается, когда брокер сообщил о закрытии соединения.
    async fn closed(
        &self,
        handle: &Self::Handle,
    );

    fn is_open(
        &self,
        handle: &Self::Handle,
    ) -> bool;

    /// Закрывает соединение. Ошибки только логируются.
    async fn teardown(
        &self,
        handle: Self::Handle,
    );

    /// Объявляет топик и открывает на нём поток доставок.
    async fn open_consumer(
        &self,
        handle: &Self::Handle,
        topic: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError>;

    /// Публикует тело в топик, записав контекст трассы в заголовки.
    async fn publish(
        &self,
        handle: &Self::Handle,
        tracer: &dyn Tracer,
        ctx: &Context,
        topic: &str,
        body: Bytes,
        reply_to: Option<&str>,
    ) -> Result<(), QueueError>;

    async fn open_reply_inbox(
        &self,
        handle: &Self::Handle,
    ) -> Result<ReplyInbox, QueueError>;

    /// Освобождает адрес ответа. Ошибки только логируются.
    async fn close_reply_inbox(
        &self,
        handle: &Self::Handle,
        inbox: ReplyInbox,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        timing: AckTiming,
    }

    #[test]
    fn test_ack_timing_deserialize() {
        let w: Wrapper = serde_json::from_str(r#"{"timing":"after_callback"}"#).unwrap();
        assert_eq!(w.timing, AckTiming::AfterCallback);
        assert_eq!(AckTiming::default(), AckTiming::BeforeCallback);
    }
}
