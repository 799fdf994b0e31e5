//! Брокер с моделью потоков (диалект JetStream).
//!
//! Транспорт описан трейтами [`StreamDialer`] и [`StreamSession`].
//! [`MemoryStreamBroker`] держит в памяти:
//!
//! - потоки: журнал сообщений с монотонными номерами и набором subject'ов;
//! - потребителей потока с фильтром и явным подтверждением;
//! - обычные (core) подписки, через которые работают inbox'ы ответов.
//!
//! Состояние подтверждений хранится по ключу подтверждения: имени фильтра
//! или `durable:фильтр`. Новый потребитель с тем же ключом продолжает с
//! первого неподтверждённого сообщения.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::TransportError;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use super::topic::{filter_within, is_literal_subject, subject_matches};

pub type StreamResult<T> = Result<T, TransportError>;

/// Заголовки сообщения: ключ → значения.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

pub const INBOX_PREFIX: &str = "_INBOX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Хранить всё.
    #[default]
    Limits,
    /// Хранить, пока есть заинтересованные и не подтвердившие ключи.
    Interest,
    /// Удалять после первого подтверждения.
    WorkQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    pub replicas: usize,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: usize,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    None,
    #[default]
    Explicit,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Имя долговременной группы подтверждений.
    pub durable_name: Option<String>,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
}

/// Сообщение потока, доставленное потребителю.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream: String,
    pub consumer: String,
    pub sequence: u64,
    pub subject: String,
    pub reply: Option<String>,
    pub headers: HeaderMap,
    pub payload: Bytes,
    pub delivered: u32,
}

/// Сообщение обычной подписки.
#[derive(Debug, Clone)]
pub struct CoreMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub sequence: u64,
}

#[async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    async fn dial(
        &self,
        url: &str,
        connection_name: &str,
    ) -> StreamResult<Arc<dyn StreamSession>>;
}

/// Соединение с потоковым брокером.
#[async_trait]
pub trait StreamSession: Send + Sync {
    async fn stream_info(
        &self,
        name: &str,
    ) -> StreamResult<StreamInfo>;

    async fn create_stream(
        &self,
        config: StreamConfig,
    ) -> StreamResult<StreamInfo>;

    /// Создаёт потребителя и возвращает его имя.
    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> StreamResult<String>;

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<mpsc::UnboundedReceiver<StreamMessage>>;

    async fn ack(
        &self,
        stream: &str,
        consumer: &str,
        sequence: u64,
    ) -> StreamResult<()>;

    async fn delete_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<()>;

    /// Публикует сообщение. `Some(PubAck)`, если его сохранил поток.
    ///
    /// Если subject не покрыт ни потоком, ни подпиской, возвращается
    /// [`TransportError::NoResponders`].
    async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
        reply: Option<String>,
    ) -> StreamResult<Option<PubAck>>;

    /// Обычная подписка; возвращает идентификатор и получатель.
    async fn subscribe(
        &self,
        subject: &str,
    ) -> StreamResult<(u64, mpsc::UnboundedReceiver<CoreMessage>)>;

    async fn unsubscribe(
        &self,
        sid: u64,
    ) -> StreamResult<()>;

    fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple())
    }

    async fn close(&self) -> StreamResult<()>;

    fn is_closed(&self) -> bool;

    async fn closed(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Брокер в памяти
////////////////////////////////////////////////////////////////////////////////

/// Потоковый брокер в памяти процесса.
#[derive(Clone, Default)]
pub struct MemoryStreamBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<State>,
    connections: DashMap<u64, watch::Sender<bool>>,
    next_connection: AtomicU64,
    next_sid: AtomicU64,
    unreachable: AtomicBool,
    publish_count: AtomicUsize,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamEntry>,
    subscriptions: HashMap<u64, CoreSubscription>,
}

struct CoreSubscription {
    connection: u64,
    subject: String,
    tx: mpsc::UnboundedSender<CoreMessage>,
}

struct StreamEntry {
    config: StreamConfig,
    log: BTreeMap<u64, Stored>,
    last_sequence: u64,
    /// Состояние подтверждений по ключу
    acks: HashMap<String, AckState>,
    consumers: HashMap<String, ConsumerEntry>,
}

#[derive(Debug, Clone)]
struct Stored {
    subject: String,
    reply: Option<String>,
    headers: HeaderMap,
    payload: Bytes,
}

struct AckState {
    filter: String,
    acked: BTreeSet<u64>,
    deliveries: HashMap<u64, u32>,
}

struct ConsumerEntry {
    connection: u64,
    ack_key: String,
    filter: String,
    ack_policy: AckPolicy,
    tx: Option<mpsc::UnboundedSender<StreamMessage>>,
    in_flight: BTreeSet<u64>,
}

/// Сессия одного соединения с [`MemoryStreamBroker`].
pub struct MemoryStreamSession {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: watch::Receiver<bool>,
}

impl MemoryStreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(
        &self,
        reachable: bool,
    ) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Разрывает все открытые соединения со стороны брокера.
    pub fn disconnect_all(&self) {
        let ids: Vec<u64> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.inner.drop_connection(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Количество активных потребителей потока с данным фильтром.
    pub fn consumer_count(
        &self,
        stream: &str,
        filter: &str,
    ) -> usize {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| {
                s.consumers
                    .values()
                    .filter(|c| c.filter == filter && c.tx.is_some())
                    .count()
            })
    }

    pub fn stream_config(
        &self,
        stream: &str,
    ) -> Option<StreamConfig> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.config.clone())
    }

    /// Количество сохранённых сообщений потока.
    pub fn stored_messages(
        &self,
        stream: &str,
    ) -> usize {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.log.len())
    }

    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StreamDialer for MemoryStreamBroker {
    async fn dial(
        &self,
        url: &str,
        connection_name: &str,
    ) -> StreamResult<Arc<dyn StreamSession>> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                address: url.to_string(),
            });
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(false);
        self.inner.connections.insert(id, tx);
        debug!(connection = id, name = connection_name, "stream connection opened");

        Ok(Arc::new(MemoryStreamSession {
            broker: self.inner.clone(),
            id,
            closed: rx,
        }))
    }
}

impl BrokerInner {
    /// Закрывает соединение: удаляет его потребителей и подписки.
    ///
    /// Неподтверждённые сообщения остаются неподтверждёнными в своём ключе.
    fn drop_connection(
        &self,
        id: u64,
    ) {
        let Some((_, closed)) = self.connections.remove(&id) else {
            return;
        };

        {
            let mut state = self.state.lock();
            state.subscriptions.retain(|_, sub| sub.connection != id);
            for stream in state.streams.values_mut() {
                stream.consumers.retain(|_, c| c.connection != id);
            }
        }

        closed.send_replace(true);
        debug!(connection = id, "stream connection closed");
    }
}

impl StreamEntry {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            log: BTreeMap::new(),
            last_sequence: 0,
            acks: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.log.len(),
            last_sequence: self.last_sequence,
        }
    }

    fn covers(
        &self,
        subject: &str,
    ) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn has_interest(
        &self,
        subject: &str,
    ) -> bool {
        self.acks
            .values()
            .any(|state| subject_matches(&state.filter, subject))
    }

    fn append(
        &mut self,
        stored: Stored,
    ) -> u64 {
        self.last_sequence += 1;
        let seq = self.last_sequence;
        let retained = match self.config.retention {
            RetentionPolicy::Limits => true,
            RetentionPolicy::Interest | RetentionPolicy::WorkQueue => {
                self.has_interest(&stored.subject)
            }
        };
        if retained {
            self.log.insert(seq, stored);
            self.deliver_pending();
        } else {
            trace!(stream = %self.config.name, seq, "message dropped: no interest");
        }
        seq
    }

    /// Отправляет каждому потребителю сообщения, которые он ещё не получил
    /// и которые не подтверждены в его ключе.
    fn deliver_pending(&mut self) {
        let stream_name = self.config.name.clone();
        let mut auto_acked: Vec<(String, u64)> = Vec::new();

        for (name, consumer) in self.consumers.iter_mut() {
            let Some(tx) = consumer.tx.as_ref() else {
                continue;
            };
            let Some(acks) = self.acks.get_mut(&consumer.ack_key) else {
                continue;
            };

            for (&seq, stored) in self.log.iter() {
                if consumer.in_flight.contains(&seq)
                    || acks.acked.contains(&seq)
                    || !subject_matches(&consumer.filter, &stored.subject)
                {
                    continue;
                }

                let delivered = acks.deliveries.entry(seq).or_insert(0);
                *delivered += 1;
                let message = StreamMessage {
                    stream: stream_name.clone(),
                    consumer: name.clone(),
                    sequence: seq,
                    subject: stored.subject.clone(),
                    reply: stored.reply.clone(),
                    headers: stored.headers.clone(),
                    payload: stored.payload.clone(),
                    delivered: *delivered,
                };
                if tx.send(message).is_err() {
                    consumer.tx = None;
                    break;
                }
                consumer.in_flight.insert(seq);
                if consumer.ack_policy == AckPolicy::None {
                    auto_acked.push((consumer.ack_key.clone(), seq));
                }
            }
        }

        for (key, seq) in auto_acked {
            self.record_ack(&key, seq);
        }
    }

    fn record_ack(
        &mut self,
        ack_key: &str,
        seq: u64,
    ) {
        if let Some(state) = self.acks.get_mut(ack_key) {
            state.acked.insert(seq);
            state.deliveries.remove(&seq);
        }
        for consumer in self.consumers.values_mut() {
            if consumer.ack_key == ack_key {
                consumer.in_flight.remove(&seq);
            }
        }
        self.prune(seq);
    }

    fn prune(
        &mut self,
        seq: u64,
    ) {
        let Some(stored) = self.log.get(&seq) else {
            return;
        };
        let remove = match self.config.retention {
            RetentionPolicy::Limits => false,
            RetentionPolicy::WorkQueue => true,
            RetentionPolicy::Interest => self
                .acks
                .values()
                .filter(|state| subject_matches(&state.filter, &stored.subject))
                .all(|state| state.acked.contains(&seq)),
        };
        if remove {
            self.log.remove(&seq);
            // удалённое из журнала больше не доставляется никому
            for state in self.acks.values_mut() {
                state.acked.remove(&seq);
                state.deliveries.remove(&seq);
            }
        }
    }
}

impl MemoryStreamSession {
    fn ensure_open(&self) -> StreamResult<()> {
        if *self.closed.borrow() {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

fn stream_not_found(name: &str) -> TransportError {
    TransportError::NotFound {
        kind: "stream",
        name: name.to_string(),
    }
}

#[async_trait]
impl StreamSession for MemoryStreamSession {
    async fn stream_info(
        &self,
        name: &str,
    ) -> StreamResult<StreamInfo> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .streams
            .get(name)
            .map(StreamEntry::info)
            .ok_or_else(|| stream_not_found(name))
    }

    async fn create_stream(
        &self,
        config: StreamConfig,
    ) -> StreamResult<StreamInfo> {
        self.ensure_open()?;
        if config.name.is_empty() || config.subjects.is_empty() {
            return Err(TransportError::PreconditionFailed {
                reason: "stream needs a name and at least one subject".to_string(),
            });
        }

        let mut state = self.broker.state.lock();
        if let Some(existing) = state.streams.get(&config.name) {
            if existing.config != config {
                return Err(TransportError::PreconditionFailed {
                    reason: format!("stream '{}' already exists with another config", config.name),
                });
            }
            return Ok(existing.info());
        }

        let overlapping = state.streams.values().any(|other| {
            config
                .subjects
                .iter()
                .any(|s| other.covers(s) || other.config.subjects.contains(s))
        });
        if overlapping {
            return Err(TransportError::PreconditionFailed {
                reason: format!("subjects of stream '{}' overlap another stream", config.name),
            });
        }

        let entry = StreamEntry::new(config.clone());
        let info = entry.info();
        state.streams.insert(config.name, entry);
        Ok(info)
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> StreamResult<String> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| stream_not_found(stream))?;

        if !filter_within(&entry.config.subjects, &config.filter_subject) {
            return Err(TransportError::PreconditionFailed {
                reason: format!(
                    "filter '{}' is outside subjects of stream '{stream}'",
                    config.filter_subject
                ),
            });
        }

        let ack_key = match &config.durable_name {
            Some(durable) => format!("{durable}:{}", config.filter_subject),
            None => config.filter_subject.clone(),
        };
        entry
            .acks
            .entry(ack_key.clone())
            .or_insert_with(|| AckState {
                filter: config.filter_subject.clone(),
                acked: BTreeSet::new(),
                deliveries: HashMap::new(),
            });

        let name = Uuid::new_v4().simple().to_string();
        entry.consumers.insert(
            name.clone(),
            ConsumerEntry {
                connection: self.id,
                ack_key,
                filter: config.filter_subject,
                ack_policy: config.ack_policy,
                tx: None,
                in_flight: BTreeSet::new(),
            },
        );
        Ok(name)
    }

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<mpsc::UnboundedReceiver<StreamMessage>> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        let slot = entry
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| TransportError::UnknownConsumer {
                consumer: consumer.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        slot.tx = Some(tx);
        slot.in_flight.clear();
        entry.deliver_pending();
        Ok(rx)
    }

    async fn ack(
        &self,
        stream: &str,
        consumer: &str,
        sequence: u64,
    ) -> StreamResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        let ack_key = entry
            .consumers
            .get(consumer)
            .map(|c| c.ack_key.clone())
            .ok_or_else(|| TransportError::UnknownConsumer {
                consumer: consumer.to_string(),
            })?;
        entry.record_ack(&ack_key, sequence);
        Ok(())
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> StreamResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        entry
            .consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownConsumer {
                consumer: consumer.to_string(),
            })
    }

    async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
        reply: Option<String>,
    ) -> StreamResult<Option<PubAck>> {
        self.ensure_open()?;
        if !is_literal_subject(subject) {
            return Err(TransportError::PreconditionFailed {
                reason: format!("invalid publish subject '{subject}'"),
            });
        }
        self.broker.publish_count.fetch_add(1, Ordering::Relaxed);

        let mut state = self.broker.state.lock();

        let mut delivered = false;
        state.subscriptions.retain(|_, sub| {
            if !subject_matches(&sub.subject, subject) {
                return true;
            }
            let message = CoreMessage {
                subject: subject.to_string(),
                reply: reply.clone(),
                headers: headers.clone(),
                payload: payload.clone(),
            };
            let alive = sub.tx.send(message).is_ok();
            delivered |= alive;
            alive
        });

        let stream = state.streams.values_mut().find(|s| s.covers(subject));
        match stream {
            Some(stream) => {
                let sequence = stream.append(Stored {
                    subject: subject.to_string(),
                    reply,
                    headers,
                    payload,
                });
                Ok(Some(PubAck {
                    stream: stream.config.name.clone(),
                    sequence,
                }))
            }
            None if delivered => Ok(None),
            None => Err(TransportError::NoResponders {
                subject: subject.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> StreamResult<(u64, mpsc::UnboundedReceiver<CoreMessage>)> {
        self.ensure_open()?;
        let sid = self.broker.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state.lock().subscriptions.insert(
            sid,
            CoreSubscription {
                connection: self.id,
                subject: subject.to_string(),
                tx,
            },
        );
        Ok((sid, rx))
    }

    async fn unsubscribe(
        &self,
        sid: u64,
    ) -> StreamResult<()> {
        self.ensure_open()?;
        self.broker.state.lock().subscriptions.remove(&sid);
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        self.broker.drop_connection(self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        if closed.wait_for(|c| *c).await.is_err() {
            trace!("close signal dropped");
        }
    }
}

impl Drop for MemoryStreamSession {
    fn drop(&mut self) {
        self.broker.drop_connection(self.id);
    }
}
