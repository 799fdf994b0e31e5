//! Бэкенд для потоковых брокеров с журналом сообщений.
//!
//! При подключении поток ищется по имени и создаётся, если его нет. Каждая
//! подписка получает нового потребителя с фильтром по топику и явным
//! подтверждением. Запрос подписывается на уникальный inbox и публикует
//! сообщение с этим адресом ответа.

mod carrier;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::{QueueError, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub use self::carrier::HeaderCarrier;
use super::{AckTiming, Backend, Delivery, DeliveryStream, Message, ReplyInbox};
use crate::{
    broker::stream::{
        AckPolicy, ConsumerConfig, CoreMessage, RetentionPolicy, StorageType, StreamConfig,
        StreamDialer, StreamMessage, StreamSession,
    },
    config::StreamSettings,
    telemetry::{Context, TextMapCarrier, Tracer},
};

pub struct StreamBackend {
    dialer: Arc<dyn StreamDialer>,
    url: String,
    stream_name: String,
    subjects: Vec<String>,
    durable_name: Option<String>,
    ack_timing: AckTiming,
    connection_name: String,
}

struct StreamDeliveries {
    session: Arc<dyn StreamSession>,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    timing: AckTiming,
}

struct StreamDelivery {
    session: Arc<dyn StreamSession>,
    stream: String,
    consumer: String,
    sequence: u64,
    headers: HeaderCarrier,
    message: Message,
}

/// Доставки обычной подписки на inbox; подтверждать нечего.
struct InboxDeliveries {
    rx: mpsc::UnboundedReceiver<CoreMessage>,
}

struct InboxDelivery {
    headers: HeaderCarrier,
    message: Message,
}

impl StreamBackend {
    pub fn new(
        dialer: Arc<dyn StreamDialer>,
        settings: &StreamSettings,
        connection_name: impl Into<String>,
    ) -> Self {
        Self {
            dialer,
            url: settings.nats_url.clone(),
            stream_name: settings.stream_name.clone(),
            subjects: settings.subjects.clone(),
            durable_name: settings.durable_name.clone().filter(|name| !name.is_empty()),
            ack_timing: settings.ack_timing,
            connection_name: connection_name.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.stream_name.clone(),
            subjects: self.subjects.clone(),
            storage: StorageType::File,
            replicas: 1,
            retention: RetentionPolicy::Interest,
        }
    }

    async fn ensure_stream(
        &self,
        session: &Arc<dyn StreamSession>,
    ) -> Result<(), TransportError> {
        match session.stream_info(&self.stream_name).await {
            Ok(info) => {
                trace!(stream = %self.stream_name, messages = info.messages, "stream found");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!(stream = %self.stream_name, "stream not found, creating it");
                session.create_stream(self.stream_config()).await.map(|_| ())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Backend for StreamBackend {
    type Handle = Arc<dyn StreamSession>;

    fn kind(&self) -> &'static str {
        "stream"
    }

    async fn connect(&self) -> Result<Self::Handle, QueueError> {
        let session = self.dialer.dial(&self.url, &self.connection_name).await?;
        if let Err(err) = self.ensure_stream(&session).await {
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "closing session after failed setup");
            }
            return Err(QueueError::connection(format!(
                "prepare stream '{}': {err}",
                self.stream_name
            )));
        }
        Ok(session)
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
            debug!(error = %err, "closing stream session failed");
        }
    }

    async fn open_consumer(
        &self,
        handle: &Self::Handle,
        topic: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        let ack_policy = match self.ack_timing {
            AckTiming::Never => AckPolicy::None,
            AckTiming::BeforeCallback | AckTiming::AfterCallback => AckPolicy::Explicit,
        };
        let config = ConsumerConfig {
            durable_name: self.durable_name.clone(),
            filter_subject: topic.to_string(),
            ack_policy,
        };

        let consumer = handle
            .create_consumer(&self.stream_name, config)
            .await
            .map_err(|err| QueueError::subscribe(topic, err))?;
        let rx = handle
            .consume(&self.stream_name, &consumer)
            .await
            .map_err(|err| QueueError::subscribe(topic, err))?;

        Ok(Box::new(StreamDeliveries {
            session: handle.clone(),
            rx,
            timing: self.ack_timing,
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
        let mut carrier = HeaderCarrier::default();
        tracer.inject(ctx, &mut carrier);

        let ack = handle
            .publish(
                topic,
                carrier.into_inner(),
                body,
                reply_to.map(str::to_string),
            )
            .await
            .map_err(|err| QueueError::publish(topic, err))?;
        if let Some(ack) = ack {
            trace!(topic, stream = %ack.stream, sequence = ack.sequence, "message stored");
        }
        Ok(())
    }

    async fn open_reply_inbox(
        &self,
        handle: &Self::Handle,
    ) -> Result<ReplyInbox, QueueError> {
        let address = handle.new_inbox();
        let (sid, rx) = handle
            .subscribe(&address)
            .await
            .map_err(|err| QueueError::publish(address.as_str(), err))?;

        Ok(ReplyInbox {
            address,
            token: sid.to_string(),
            deliveries: Box::new(InboxDeliveries { rx }),
        })
    }

    async fn close_reply_inbox(
        &self,
        handle: &Self::Handle,
        inbox: ReplyInbox,
    ) {
        if handle.is_closed() {
            return;
        }
        let Ok(sid) = inbox.token.parse::<u64>() else {
            debug!(token = %inbox.token, "malformed inbox token");
            return;
        };
        if let Err(err) = handle.unsubscribe(sid).await {
            debug!(inbox = %inbox.address, error = %err, "unsubscribe inbox failed");
        }
    }
}

#[async_trait]
impl DeliveryStream for StreamDeliveries {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        let raw = self.rx.recv().await?;
        if raw.delivered > 1 {
            trace!(subject = %raw.subject, sequence = raw.sequence, "redelivery");
        }
        Some(Box::new(StreamDelivery {
            session: self.session.clone(),
            stream: raw.stream,
            consumer: raw.consumer,
            sequence: raw.sequence,
            headers: HeaderCarrier::new(raw.headers),
            message: Message::new(raw.payload).with_reply_to(raw.reply.unwrap_or_default()),
        }))
    }

    fn ack_timing(&self) -> AckTiming {
        self.timing
    }
}

#[async_trait]
impl Delivery for StreamDelivery {
    fn message(&self) -> Message {
        self.message.clone()
    }

    fn headers(&self) -> &dyn TextMapCarrier {
        &self.headers
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.session
            .ack(&self.stream, &self.consumer, self.sequence)
            .await
    }
}

#[async_trait]
impl DeliveryStream for InboxDeliveries {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        let raw = self.rx.recv().await?;
        Some(Box::new(InboxDelivery {
            headers: HeaderCarrier::new(raw.headers),
            message: Message::new(raw.payload).with_reply_to(raw.reply.unwrap_or_default()),
        }))
    }

    fn ack_timing(&self) -> AckTiming {
        AckTiming::Never
    }
}

#[async_trait]
impl Delivery for InboxDelivery {
    fn message(&self) -> Message {
        self.message.clone()
    }

    fn headers(&self) -> &dyn TextMapCarrier {
        &self.headers
    }

    async fn ack(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryStreamBroker;

    fn settings() -> StreamSettings {
        StreamSettings {
            nats_url: "nats://mem".into(),
            stream_name: "ORDERS".into(),
            subjects: vec!["orders.*".into(), "partners".into()],
            durable_name: None,
            ack_timing: AckTiming::BeforeCallback,
        }
    }

    /// Тест проверяет, что отсутствующий поток создаётся с файловым
    /// хранилищем, одной репликой и удержанием по интересу.
    #[tokio::test]
    async fn test_connect_creates_missing_stream() {
        let broker = MemoryStreamBroker::new();
        let backend = StreamBackend::new(Arc::new(broker.clone()), &settings(), "orders");
        let handle = backend.connect().await.unwrap();

        let config = broker.stream_config("ORDERS").unwrap();
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.replicas, 1);
        assert_eq!(config.retention, RetentionPolicy::Interest);
        assert_eq!(config.subjects, settings().subjects);

        // повторное подключение находит существующий поток
        let again = backend.connect().await.unwrap();
        backend.teardown(again).await;
        backend.teardown(handle).await;
    }

    #[tokio::test]
    async fn test_subscribe_outside_stream_subjects_fails() {
        let broker = MemoryStreamBroker::new();
        let backend = StreamBackend::new(Arc::new(broker), &settings(), "orders");
        let handle = backend.connect().await.unwrap();
        let err = backend.open_consumer(&handle, "products.ready").await.err().unwrap();
        assert!(matches!(err, QueueError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_subject_is_publish_error() {
        let broker = MemoryStreamBroker::new();
        let backend = StreamBackend::new(Arc::new(broker), &settings(), "orders");
        let handle = backend.connect().await.unwrap();
        let tracer = crate::telemetry::NoopTracer;
        let err = backend
            .publish(
                &handle,
                &tracer,
                &Context::background(),
                "nobody.home",
                Bytes::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_inbox_round_trip() {
        let broker = MemoryStreamBroker::new();
        let backend = StreamBackend::new(Arc::new(broker), &settings(), "orders");
        let handle = backend.connect().await.unwrap();
        let tracer = crate::telemetry::NoopTracer;

        let mut inbox = backend.open_reply_inbox(&handle).await.unwrap();
        assert!(inbox.address.starts_with("_INBOX."));
        backend
            .publish(
                &handle,
                &tracer,
                &Context::background(),
                &inbox.address,
                Bytes::from("pong"),
                None,
            )
            .await
            .unwrap();

        let reply = inbox.deliveries.next().await.unwrap();
        assert_eq!(reply.message().body(), &Bytes::from("pong"));
        backend.close_reply_inbox(&handle, inbox).await;
    }
}
