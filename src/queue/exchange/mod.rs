//! Бэкенд для брокеров с моделью обменников и очередей.
//!
//! Топология:
//! - при подключении объявляется долговременный topic-обменник из настроек;
//! - подписка объявляет долговременную очередь с именем топика и привязывает
//!   её к обменнику;
//! - `publish` идёт через обменник по умолчанию, ключ маршрутизации равен
//!   топику;
//! - запрос объявляет эксклюзивную очередь ответов и публикуется через
//!   обменник из настроек с заполненным `reply_to`.
//!
//! Доставки подтверждаются после возврата обработчика.

mod carrier;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::{QueueError, TransportError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub use self::carrier::TableCarrier;
use super::{AckTiming, Backend, Delivery, DeliveryStream, Message, ReplyInbox};
use crate::{
    broker::exchange::{
        self as amqp, BasicProperties, ConsumeOptions, DeliveryMode, ExchangeChannel,
        ExchangeDialer, ExchangeKind, ExchangeOptions, Publishing, QueueOptions,
    },
    config::ExchangeSettings,
    telemetry::{Context, TextMapCarrier, Tracer},
};

pub const CONTENT_TYPE: &str = "application/json";

/// Подстановка имени топика в шаблон ключа привязки.
pub const TOPIC_PLACEHOLDER: &str = "{topic}";

pub struct ExchangeBackend {
    dialer: Arc<dyn ExchangeDialer>,
    url: String,
    exchange: String,
    binding_key: String,
    connection_name: String,
}

struct ExchangeDeliveries {
    channel: Arc<dyn ExchangeChannel>,
    rx: mpsc::UnboundedReceiver<amqp::Delivery>,
    timing: AckTiming,
}

struct ExchangeDelivery {
    channel: Arc<dyn ExchangeChannel>,
    tag: u64,
    headers: TableCarrier,
    message: Message,
}

impl ExchangeBackend {
    pub fn new(
        dialer: Arc<dyn ExchangeDialer>,
        settings: &ExchangeSettings,
        connection_name: impl Into<String>,
    ) -> Self {
        let binding_key = if settings.routing_key.is_empty() {
            TOPIC_PLACEHOLDER.to_string()
        } else {
            settings.routing_key.clone()
        };
        Self {
            dialer,
            url: settings.amqp_url.clone(),
            exchange: settings.exchange.clone(),
            binding_key,
            connection_name: connection_name.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Ключ привязки очереди топика к обменнику.
    pub fn binding_key(
        &self,
        topic: &str,
    ) -> String {
        self.binding_key.replace(TOPIC_PLACEHOLDER, topic)
    }

    fn properties(
        tracer: &dyn Tracer,
        ctx: &Context,
        reply_to: Option<&str>,
    ) -> BasicProperties {
        let mut carrier = TableCarrier::default();
        tracer.inject(ctx, &mut carrier);
        BasicProperties {
            headers: carrier.into_inner(),
            content_type: Some(CONTENT_TYPE.to_string()),
            delivery_mode: DeliveryMode::Persistent,
            reply_to: reply_to.map(str::to_string),
            correlation_id: None,
        }
    }
}

#[async_trait]
impl Backend for ExchangeBackend {
    type Handle = Arc<dyn ExchangeChannel>;

    fn kind(&self) -> &'static str {
        "exchange"
    }

    async fn connect(&self) -> Result<Self::Handle, QueueError> {
        let channel = self.dialer.dial(&self.url, &self.connection_name).await?;

        let declared = channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeOptions {
                    durable: true,
                    auto_delete: false,
                },
            )
            .await;
        if let Err(err) = declared {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "closing channel after failed setup");
            }
            return Err(QueueError::connection(format!(
                "declare exchange '{}': {err}",
                self.exchange
            )));
        }

        Ok(channel)
    }

    async fn closed(
        &self,
        handle: &Self::Handle,
    ) {
        handle.closed().await;
    }

    fn is_open(
        &self,
        handle: &Self::Handle,
    ) -> bool {
        !handle.is_closed()
    }

    async fn teardown(
        &self,
        handle: Self::Handle,
    ) {
        if handle.is_closed() {
            return;
        }
        if let Err(err) = handle.close().await {
            debug!(error = %err, "closing exchange channel failed");
        }
    }

    async fn open_consumer(
        &self,
        handle: &Self::Handle,
        topic: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        let subscribe_err = |err: TransportError| QueueError::subscribe(topic, err);

        handle
            .queue_declare(
                topic,
                QueueOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(subscribe_err)?;
        handle
            .queue_bind(topic, &self.binding_key(topic), &self.exchange)
            .await
            .map_err(subscribe_err)?;

        // у каждого потребителя свой тег: повторная подписка на топик законна
        let tag = format!("{topic}.{}", Uuid::new_v4().simple());
        let rx = handle
            .basic_consume(topic, &tag, ConsumeOptions { auto_ack: false })
            .await
            .map_err(subscribe_err)?;

        Ok(Box::new(ExchangeDeliveries {
            channel: handle.clone(),
            rx,
            timing: AckTiming::AfterCallback,
        }))
    }

    async fn publish(
        &self,
        handle: &Self::Handle,
        tracer: &dyn Tracer,
        ctx: &Context,
        topic: &str,
        body: Bytes,
        reply_to: Option<&str>,
    ) -> Result<(), QueueError> {
        let properties = Self::properties(tracer, ctx, reply_to);
        let (exchange, routing_key) = match reply_to {
            Some(_) => (self.exchange.as_str(), self.binding_key(topic)),
            None => ("", topic.to_string()),
        };

        handle
            .basic_publish(exchange, &routing_key, Publishing { properties, body })
            .await
            .map_err(|err| QueueError::publish(topic, err))
    }

    async fn open_reply_inbox(
        &self,
        handle: &Self::Handle,
    ) -> Result<ReplyInbox, QueueError> {
        let address = handle
            .queue_declare(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                },
            )
            .await
            .map_err(|err| QueueError::publish("reply queue", err))?;

        let token = format!("reply.{}", Uuid::new_v4().simple());
        let rx = handle
            .basic_consume(&address, &token, ConsumeOptions { auto_ack: true })
            .await
            .map_err(|err| QueueError::publish(address.as_str(), err))?;

        Ok(ReplyInbox {
            address,
            token,
            deliveries: Box::new(ExchangeDeliveries {
                channel: handle.clone(),
                rx,
                timing: AckTiming::Never,
            }),
        })
    }

    async fn close_reply_inbox(
        &self,
        handle: &Self::Handle,
        inbox: ReplyInbox,
    ) {
        // эксклюзивная очередь исчезает вместе с закрытым соединением
        if handle.is_closed() {
            return;
        }
        if let Err(err) = handle.basic_cancel(&inbox.token).await {
            debug!(queue = %inbox.address, error = %err, "cancel reply consumer failed");
        }
        if let Err(err) = handle.queue_delete(&inbox.address).await {
            debug!(queue = %inbox.address, error = %err, "delete reply queue failed");
        }
    }
}

#[async_trait]
impl DeliveryStream for ExchangeDeliveries {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        let raw = self.rx.recv().await?;
        let reply_to = raw.properties.reply_to.unwrap_or_default();
        Some(Box::new(ExchangeDelivery {
            channel: self.channel.clone(),
            tag: raw.delivery_tag,
            headers: TableCarrier::new(raw.properties.headers),
            message: Message::new(raw.body).with_reply_to(reply_to),
        }))
    }

    fn ack_timing(&self) -> AckTiming {
        self.timing
    }
}

#[async_trait]
impl Delivery for ExchangeDelivery {
    fn message(&self) -> Message {
        self.message.clone()
    }

    fn headers(&self) -> &dyn TextMapCarrier {
        &self.headers
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.channel.basic_ack(self.tag).await
    }
}
