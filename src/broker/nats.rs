//! Драйвер NATS JetStream поверх `async-nats` (feature `nats`).
//!
//! Потребители создаются pull-потребителями с фильтром по subject. Адрес
//! ответа хранится в заголовке [`REPLY_TO_HEADER`]: JetStream сам
//! использует reply-subject публикации для своего подтверждения.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_nats::{
    connection::State as ConnectionState,
    jetstream::{
        self,
        consumer::{self, pull, PullConsumer},
        context::{GetStreamErrorKind, PublishErrorKind},
        errors::ErrorCode,
        stream,
    },
    Client, ConnectOptions, Event,
};
use async_trait::async_trait;
use bytes::Bytes;
use courier_error::TransportError;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::stream::{
    AckPolicy, ConsumerConfig, CoreMessage, HeaderMap, PubAck, RetentionPolicy, StorageType,
    StreamConfig, StreamDialer, StreamInfo, StreamMessage, StreamResult, StreamSession,
    INBOX_PREFIX,
};

/// Заголовок с адресом ответа для сообщений, сохранённых в потоке.
pub const REPLY_TO_HEADER: &str = "Courier-Reply-To";

/// Время, после которого сервер удаляет брошенного эфемерного потребителя.
const EPHEMERAL_INACTIVITY: Duration = Duration::from_secs(30);

/// Подключается к NATS по URL вида `nats://host:4222`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsDialer;

pub struct NatsSession {
    client: Client,
    jetstream: jetstream::Context,
    closed: Arc<watch::Sender<bool>>,
    /// Неподтверждённые сообщения: (поток, потребитель, номер)
    pending: Arc<DashMap<(String, String, u64), jetstream::Message>>,
    forwarders: DashMap<u64, JoinHandle<()>>,
    next_id: AtomicU64,
}

#[async_trait]
impl StreamDialer for NatsDialer {
    async fn dial(
        &self,
        url: &str,
        connection_name: &str,
    ) -> StreamResult<Arc<dyn StreamSession>> {
        let closed = Arc::new(watch::Sender::new(false));
        let notify = closed.clone();
        let client = ConnectOptions::new()
            .name(connection_name)
            .event_callback(move |event| {
                let notify = notify.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            warn!("nats connection lost");
                            notify.send_replace(true);
                        }
                        other => debug!(event = %other, "nats connection event"),
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|err| {
                debug!(error = %err, "nats dial failed");
                TransportError::Unreachable {
                    address: url.to_string(),
                }
            })?;
        debug!(name = connection_name, "nats connection opened");

        Ok(Arc::new(NatsSession {
            jetstream: jetstream::new(client.clone()),
            client,
            closed,
            pending: Arc::default(),
            forwarders: DashMap::new(),
            next_id: AtomicU64::new(1),
        }))
    }
}

fn broker_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Broker {
        reason: err.to_string(),
    }
}

/// Имя потребителя NATS не может содержать разделители subject.
fn consumer_name(
    durable: &str,
    filter: &str,
) -> String {
    let filter: String = filter
        .chars()
        .map(|c| match c {
            '.' => '_',
            '*' => 'S',
            '>' => 'A',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    format!("{durable}_{filter}")
}

fn to_nats_headers(headers: &HeaderMap) -> async_nats::HeaderMap {
    let mut out = async_nats::HeaderMap::new();
    for (name, values) in headers {
        for value in values {
            out.append(name.as_str(), value.as_str());
        }
    }
    out
}

/// Переводит заголовки и вынимает из них адрес ответа.
fn from_nats_headers(headers: Option<&async_nats::HeaderMap>) -> (HeaderMap, Option<String>) {
    let mut out = HeaderMap::new();
    let Some(headers) = headers else {
        return (out, None);
    };
    for (name, values) in headers.iter() {
        out.entry(name.to_string())
            .or_default()
            .extend(values.iter().map(|value| value.to_string()));
    }
    let reply = out
        .remove(REPLY_TO_HEADER)
        .and_then(|values| values.into_iter().next());
    (out, reply)
}

fn to_stream_info(info: &stream::Info) -> StreamInfo {
    StreamInfo {
        config: StreamConfig {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            storage: match info.config.storage {
                stream::StorageType::Memory => StorageType::Memory,
                _ => StorageType::File,
            },
            replicas: info.config.num_replicas,
            retention: match info.config.retention {
                stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
                stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
                _ => RetentionPolicy::Limits,
            },
        },
        messages: usize::try_from(info.state.messages).unwrap_or(usize::MAX),
        last_sequence: info.state.last_sequence,
    }
}

impl NatsSession {
    fn ensure_open(&self) -> StreamResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn get_stream(
        &self,
        name: &str,
    ) -> StreamResult<jetstream::stream::Stream> {
        self.jetstream.get_stream(name).await.map_err(|err| match err.kind() {
            GetStreamErrorKind::JetStream(inner)
                if inner.error_code() == ErrorCode::STREAM_NOT_FOUND =>
            {
                TransportError::NotFound {
                    kind: "stream",
                    name: name.to_string(),
                }
            }
            _ => broker_error(err),
        })
    }

    fn track(
        &self,
        task: JoinHandle<()>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.forwarders.retain(|_, running| !running.is_finished());
        self.forwarders.insert(id, task);
        id
    }
}

#[async_trait]
impl StreamSession for NatsSession {
    async fn stream_info(
        &self,
        name: &str,
    ) -> StreamResult<StreamInfo> {
        self.ensure_open()?;
        let stream = self.get_stream(name).await?;
        Ok(to_stream_info(stream.cached_info()))
    }

    async fn create_stream(
        &self,
        config: StreamConfig,
    ) -> StreamResult<StreamInfo> {
        self.ensure_open()?;
        let stream = self
            .jetstream
            .create_stream(stream::Config {
                name: config.name,
                subjects: config.subjects,
                storage: match config.storage {
                    StorageType::File => stream::StorageType::File,
                    StorageType::Memory => stream::StorageType::Memory,
                },
                num_replicas: config.replicas,
                retention: match config.retention {
                    RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
                    RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
                    RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
                },
                ..Default::default()
            })
            .await
            .map_err(broker_error)?;
        Ok(to_stream_info(stream.cached_info()))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> StreamResult<String> {
        self.ensure_open()?;
        let handle = self.get_stream(stream).await?;
        let ack_policy = match config.ack_policy {
            AckPolicy::None => consumer::AckPolicy::None,
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
        };
        let pull_config = match &config.durable_name {
            Some(durable) => {
                let name = consumer_name(durable, &config.filter_subject);
                pull::Config {
                    durable_name: Some(name.clone()),
                    name: Some(name),
                    filter_subject: config.filter_subject,
                    ack_policy,
                    ..Default::default()
                }
            }
            None => pull::Config {
                name: Some(Uuid::new_v4().simple().to_string()),
                filter_subject: config.filter_subject,
                ack_policy,
                inactive_threshold: EPHEMERAL_INACTIVITY,
                ..Default::default()
            },
        };
        let created: PullConsumer = handle
            .create_consumer(pull_config)
            .await
            .map_err(broker_error)?;
        Ok(created.cached_info().name.clone())
    }

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<mpsc::UnboundedReceiver<StreamMessage>> {
        self.ensure_open()?;
        let handle = self.get_stream(stream).await?;
        let pull_consumer: PullConsumer = handle.get_consumer(consumer).await.map_err(|err| {
            debug!(consumer, error = %err, "consumer lookup failed");
            TransportError::UnknownConsumer {
                consumer: consumer.to_string(),
            }
        })?;
        let explicit = matches!(
            pull_consumer.cached_info().config.ack_policy,
            consumer::AckPolicy::Explicit
        );
        let mut messages = pull_consumer.messages().await.map_err(broker_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = self.pending.clone();
        let consumer_name = consumer.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(consumer = %consumer_name, error = %err, "pull failed");
                        continue;
                    }
                };
                let (stream, sequence, delivered) = match message.info() {
                    Ok(info) => (
                        info.stream.to_string(),
                        info.stream_sequence,
                        u32::try_from(info.delivered).unwrap_or(u32::MAX),
                    ),
                    Err(err) => {
                        debug!(consumer = %consumer_name, error = %err, "message without metadata");
                        continue;
                    }
                };
                let (headers, reply) = from_nats_headers(message.headers.as_ref());
                let delivery = StreamMessage {
                    stream: stream.clone(),
                    consumer: consumer_name.clone(),
                    sequence,
                    subject: message.subject.to_string(),
                    reply,
                    headers,
                    payload: message.payload.clone(),
                    delivered,
                };
                if explicit {
                    pending.insert((stream, consumer_name.clone(), sequence), message);
                }
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            trace!(consumer = %consumer_name, "pull stream ended");
        });
        self.track(forwarder);
        Ok(rx)
    }

    async fn ack(
        &self,
        stream: &str,
        consumer: &str,
        sequence: u64,
    ) -> StreamResult<()> {
        self.ensure_open()?;
        let key = (stream.to_string(), consumer.to_string(), sequence);
        let Some((_, message)) = self.pending.remove(&key) else {
            return Err(TransportError::PreconditionFailed {
                reason: format!("message {sequence} of '{consumer}' is not pending"),
            });
        };
        message.ack().await.map_err(broker_error)
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<()> {
        self.ensure_open()?;
        self.pending
            .retain(|(s, c, _), _| !(s == stream && c == consumer));
        let handle = self.get_stream(stream).await?;
        handle
            .delete_consumer(consumer)
            .await
            .map(|_| ())
            .map_err(broker_error)
    }

    async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
        reply: Option<String>,
    ) -> StreamResult<Option<PubAck>> {
        self.ensure_open()?;
        let mut headers = to_nats_headers(&headers);

        // ответы во входящие ящики идут мимо потоков
        if subject.starts_with(INBOX_PREFIX) {
            let sent = match reply {
                Some(reply) => {
                    self.client
                        .publish_with_reply_and_headers(subject.to_string(), reply, headers, payload)
                        .await
                }
                None => {
                    self.client
                        .publish_with_headers(subject.to_string(), headers, payload)
                        .await
                }
            };
            sent.map_err(broker_error)?;
            return Ok(None);
        }

        if let Some(reply) = &reply {
            headers.insert(REPLY_TO_HEADER, reply.as_str());
        }
        let no_responders = |kind: PublishErrorKind| {
            if matches!(kind, PublishErrorKind::StreamNotFound) {
                TransportError::NoResponders {
                    subject: subject.to_string(),
                }
            } else {
                TransportError::Broker {
                    reason: format!("publish to '{subject}': {kind:?}"),
                }
            }
        };
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|err| no_responders(err.kind()))?
            .await
            .map_err(|err| no_responders(err.kind()))?;
        Ok(Some(PubAck {
            stream: ack.stream,
            sequence: ack.sequence,
        }))
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> StreamResult<(u64, mpsc::UnboundedReceiver<CoreMessage>)> {
        self.ensure_open()?;
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(broker_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let (headers, _) = from_nats_headers(message.headers.as_ref());
                let core = CoreMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|reply| reply.to_string()),
                    headers,
                    payload: message.payload,
                };
                if tx.send(core).is_err() {
                    break;
                }
            }
        });
        Ok((self.track(forwarder), rx))
    }

    async fn unsubscribe(
        &self,
        sid: u64,
    ) -> StreamResult<()> {
        // подписка NATS снимается вместе с задачей, владеющей Subscriber
        if let Some((_, task)) = self.forwarders.remove(&sid) {
            task.abort();
        }
        Ok(())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn close(&self) -> StreamResult<()> {
        let was_closed = self.closed.send_replace(true);
        self.forwarders.retain(|_, task| {
            task.abort();
            false
        });
        self.pending.clear();
        if !was_closed {
            if let Err(err) = self.client.flush().await {
                debug!(error = %err, "flush before close failed");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
            || matches!(self.client.connection_state(), ConnectionState::Disconnected)
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        if closed.wait_for(|c| *c).await.is_err() {
            trace!("nats close signal dropped");
        }
    }
}

impl Drop for NatsSession {
    fn drop(&mut self) {
        for entry in self.forwarders.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name_strips_subject_tokens() {
        assert_eq!(consumer_name("billing", "orders.*.created"), "billing_orders_S_created");
        assert_eq!(consumer_name("billing", "orders.>"), "billing_orders_A");
    }

    /// Тест проверяет, что адрес ответа переносится через заголовок и не
    /// попадает в заголовки, которые видит обработчик.
    #[test]
    fn test_reply_header_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent".into(), vec!["00-abc-def-01".into()]);
        let mut nats = to_nats_headers(&headers);
        nats.insert(REPLY_TO_HEADER, "_INBOX.reply");

        let (back, reply) = from_nats_headers(Some(&nats));
        assert_eq!(back, headers);
        assert_eq!(reply.as_deref(), Some("_INBOX.reply"));

        let (empty, none) = from_nats_headers(None);
        assert!(empty.is_empty());
        assert!(none.is_none());
    }
}
