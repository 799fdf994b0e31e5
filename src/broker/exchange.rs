//! Брокер с моделью обменников и очередей (диалект AMQP 0-9-1).
//!
//! Транспорт описан трейтами [`ExchangeDialer`] и [`ExchangeChannel`]; очередь
//! сообщений работает только через них. [`MemoryExchangeBroker`] реализует эту
//! модель в памяти процесса:
//!
//! - обменник по умолчанию `""` маршрутизирует по имени очереди;
//! - обменники `direct`, `topic` и `fanout` с привязками;
//! - потребители очереди получают сообщения по кругу;
//! - неподтверждённые сообщения возвращаются в очередь при закрытии канала
//!   и доставляются повторно с флагом `redelivered`;
//! - эксклюзивные очереди удаляются вместе с соединением-владельцем.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
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

use super::topic::routing_key_matches;

pub type ExchangeResult<T> = Result<T, TransportError>;

/// Таблица заголовков сообщения.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Значение заголовка. Строковым считается только `LongString`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    LongString(String),
    LongInt(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub headers: FieldTable,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Publishing {
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Сообщение, доставленное потребителю.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
}

/// Устанавливает соединение с брокером и открывает на нём канал.
#[async_trait]
pub trait ExchangeDialer: Send + Sync + 'static {
    async fn dial(
        &self,
        url: &str,
        connection_name: &str,
    ) -> ExchangeResult<Arc<dyn ExchangeChannel>>;
}

/// Соединение вместе с его единственным каналом.
#[async_trait]
pub trait ExchangeChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> ExchangeResult<()>;

    /// Объявляет очередь. Пустое имя просит брокер сгенерировать его.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> ExchangeResult<String>;

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> ExchangeResult<()>;

    async fn queue_delete(
        &self,
        queue: &str,
    ) -> ExchangeResult<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> ExchangeResult<()>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> ExchangeResult<mpsc::UnboundedReceiver<Delivery>>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
    ) -> ExchangeResult<()>;

    async fn basic_ack(
        &self,
        delivery_tag: u64,
    ) -> ExchangeResult<()>;

    async fn close(&self) -> ExchangeResult<()>;

    fn is_closed(&self) -> bool;

    /// Завершается, когда соединение закрыто любой из сторон.
    async fn closed(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Брокер в памяти
////////////////////////////////////////////////////////////////////////////////

/// Брокер обменников и очередей в памяти процесса.
///
/// Клонирование даёт ещё одну ручку на тот же брокер.
#[derive(Clone, Default)]
pub struct MemoryExchangeBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    topology: Mutex<Topology>,
    /// Открытые соединения → сигнал закрытия
    connections: DashMap<u64, watch::Sender<bool>>,
    next_connection: AtomicU64,
    unreachable: AtomicBool,
    /// Общее количество вызовов `basic_publish`
    publish_count: AtomicUsize,
    /// Сообщения, не попавшие ни в одну очередь
    unroutable_count: AtomicUsize,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    /// Неподтверждённые доставки по соединениям: тег → (очередь, сообщение)
    unacked: HashMap<u64, HashMap<u64, (String, Queued)>>,
    next_tag: HashMap<u64, u64>,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
    /// (очередь, ключ привязки)
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct QueueEntry {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<Queued>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ConsumerEntry {
    connection: u64,
    tag: String,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Clone)]
struct Queued {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    body: Bytes,
}

/// Канал одного соединения с [`MemoryExchangeBroker`].
pub struct MemoryExchangeChannel {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: watch::Receiver<bool>,
}

impl MemoryExchangeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Включает или выключает доступность брокера для новых соединений.
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

    /// Количество потребителей очереди; 0, если очереди нет.
    pub fn consumer_count(
        &self,
        queue: &str,
    ) -> usize {
        self.inner
            .topology
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Количество сообщений, ожидающих доставки.
    pub fn queue_depth(
        &self,
        queue: &str,
    ) -> usize {
        self.inner
            .topology
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn has_exchange(
        &self,
        name: &str,
    ) -> bool {
        self.inner.topology.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(
        &self,
        name: &str,
    ) -> bool {
        self.inner.topology.lock().queues.contains_key(name)
    }

    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::Relaxed)
    }

    pub fn unroutable_count(&self) -> usize {
        self.inner.unroutable_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExchangeDialer for MemoryExchangeBroker {
    async fn dial(
        &self,
        url: &str,
        connection_name: &str,
    ) -> ExchangeResult<Arc<dyn ExchangeChannel>> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                address: url.to_string(),
            });
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(false);
        self.inner.connections.insert(id, tx);
        debug!(connection = id, name = connection_name, "exchange connection opened");

        Ok(Arc::new(MemoryExchangeChannel {
            broker: self.inner.clone(),
            id,
            closed: rx,
        }))
    }
}

impl BrokerInner {
    /// Закрывает соединение: снимает его потребителей, возвращает
    /// неподтверждённые сообщения в очереди и удаляет эксклюзивные очереди.
    fn drop_connection(
        &self,
        id: u64,
    ) {
        let Some((_, closed)) = self.connections.remove(&id) else {
            return;
        };

        {
            let mut topology = self.topology.lock();
            let unacked = topology.unacked.remove(&id).unwrap_or_default();
            topology.next_tag.remove(&id);

            let mut requeued: Vec<(u64, String, Queued)> = unacked
                .into_iter()
                .map(|(tag, (queue, msg))| (tag, queue, msg))
                .collect();
            requeued.sort_by_key(|(tag, ..)| std::cmp::Reverse(*tag));
            for (_, queue, mut msg) in requeued {
                if let Some(entry) = topology.queues.get_mut(&queue) {
                    msg.redelivered = true;
                    entry.messages.push_front(msg);
                }
            }

            let mut touched = Vec::new();
            for (name, queue) in topology.queues.iter_mut() {
                let before = queue.consumers.len();
                queue.consumers.retain(|c| c.connection != id);
                if before != queue.consumers.len() || !queue.messages.is_empty() {
                    touched.push(name.clone());
                }
            }

            topology.queues.retain(|_, q| {
                q.exclusive_owner != Some(id) && !(q.auto_delete && q.consumers.is_empty())
            });

            for name in touched {
                topology.dispatch(&name);
            }
        }

        closed.send_replace(true);
        debug!(connection = id, "exchange connection closed");
    }
}

impl Topology {
    /// Раздаёт ожидающие сообщения очереди её потребителям по кругу.
    fn dispatch(
        &mut self,
        queue_name: &str,
    ) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() || queue.messages.is_empty() {
                return;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = idx + 1;
            let Some(msg) = queue.messages.pop_front() else {
                return;
            };
            let consumer = &queue.consumers[idx];
            let connection = consumer.connection;
            let auto_ack = consumer.auto_ack;

            let tag = {
                let next = self.next_tag.entry(connection).or_insert(0);
                *next += 1;
                *next
            };

            let delivery = Delivery {
                delivery_tag: tag,
                consumer_tag: consumer.tag.clone(),
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: msg.redelivered,
                properties: msg.properties.clone(),
                body: msg.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // получатель ушёл: убираем потребителя и возвращаем сообщение
                trace!(queue = queue_name, "dropping stale consumer");
                queue.consumers.remove(idx);
                queue.messages.push_front(msg);
                continue;
            }

            if !auto_ack {
                self.unacked
                    .entry(connection)
                    .or_default()
                    .insert(tag, (queue_name.to_string(), msg));
            }
        }
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> ExchangeResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        let mut targets: Vec<String> = entry
            .bindings
            .iter()
            .filter(|(_, key)| match entry.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => routing_key_matches(key, routing_key),
                ExchangeKind::Fanout => true,
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        Ok(targets)
    }
}

impl MemoryExchangeChannel {
    fn ensure_open(&self) -> ExchangeResult<()> {
        if *self.closed.borrow() {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExchangeChannel for MemoryExchangeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();
        if let Some(existing) = topology.exchanges.get(name) {
            if existing.kind != kind || existing.durable != options.durable {
                return Err(TransportError::PreconditionFailed {
                    reason: format!("inequivalent arguments for exchange '{name}'"),
                });
            }
            return Ok(());
        }
        topology.exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                kind,
                durable: options.durable,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> ExchangeResult<String> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut topology = self.broker.topology.lock();
        if let Some(existing) = topology.queues.get(&name) {
            if let Some(owner) = existing.exclusive_owner {
                if owner != self.id {
                    return Err(TransportError::PreconditionFailed {
                        reason: format!("queue '{name}' is exclusive to another connection"),
                    });
                }
            }
            if existing.durable != options.durable {
                return Err(TransportError::PreconditionFailed {
                    reason: format!("inequivalent arguments for queue '{name}'"),
                });
            }
            return Ok(name);
        }

        topology.queues.insert(
            name.clone(),
            QueueEntry {
                durable: options.durable,
                auto_delete: options.auto_delete,
                exclusive_owner: options.exclusive.then_some(self.id),
                ..QueueEntry::default()
            },
        );
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();
        if !topology.queues.contains_key(queue) {
            return Err(TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let entry = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_delete(
        &self,
        queue: &str,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();
        topology.queues.remove(queue);
        for exchange in topology.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != queue);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        self.broker.publish_count.fetch_add(1, Ordering::Relaxed);

        let mut topology = self.broker.topology.lock();
        let targets = topology.route(exchange, routing_key)?;
        if targets.is_empty() {
            self.broker.unroutable_count.fetch_add(1, Ordering::Relaxed);
            trace!(exchange, routing_key, "message dropped as unroutable");
            return Ok(());
        }

        for queue in targets {
            if let Some(entry) = topology.queues.get_mut(&queue) {
                entry.messages.push_back(Queued {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    properties: publishing.properties.clone(),
                    body: publishing.body.clone(),
                });
            }
            topology.dispatch(&queue);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> ExchangeResult<mpsc::UnboundedReceiver<Delivery>> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();

        let taken: HashSet<&str> = topology
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| c.connection == self.id)
            .map(|c| c.tag.as_str())
            .collect();
        if taken.contains(consumer_tag) {
            return Err(TransportError::PreconditionFailed {
                reason: format!("consumer tag '{consumer_tag}' already in use"),
            });
        }

        let entry = topology
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry {
            connection: self.id,
            tag: consumer_tag.to_string(),
            auto_ack: options.auto_ack,
            tx,
        });
        topology.dispatch(queue);
        Ok(rx)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();
        let mut found = false;
        for queue in topology.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.connection == self.id && c.tag == consumer_tag));
            found |= before != queue.consumers.len();
        }
        if !found {
            return Err(TransportError::UnknownConsumer {
                consumer: consumer_tag.to_string(),
            });
        }
        topology
            .queues
            .retain(|_, q| !(q.auto_delete && q.consumers.is_empty()));
        Ok(())
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
    ) -> ExchangeResult<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology.lock();
        topology
            .unacked
            .get_mut(&self.id)
            .and_then(|pending| pending.remove(&delivery_tag))
            .map(|_| ())
            .ok_or_else(|| TransportError::PreconditionFailed {
                reason: format!("unknown delivery tag {delivery_tag}"),
            })
    }

    async fn close(&self) -> ExchangeResult<()> {
        self.broker.drop_connection(self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // ошибка означает, что брокер удалил отправитель: соединение закрыто
        if closed.wait_for(|c| *c).await.is_err() {
            trace!("close signal dropped");
        }
    }
}

impl Drop for MemoryExchangeChannel {
    fn drop(&mut self) {
        self.broker.drop_connection(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publishing(body: &'static str) -> Publishing {
        Publishing {
            properties: BasicProperties::default(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    async fn durable_queue(
        ch: &Arc<dyn ExchangeChannel>,
        name: &str,
    ) {
        ch.queue_declare(
            name,
            QueueOptions {
                durable: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        durable_queue(&ch, "orders").await;

        ch.basic_publish("", "orders", publishing("a")).await.unwrap();
        ch.basic_publish("", "nobody", publishing("b")).await.unwrap();

        assert_eq!(broker.queue_depth("orders"), 1);
        assert_eq!(broker.unroutable_count(), 1);
    }

    #[tokio::test]
    async fn test_topic_exchange_bindings() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        ch.exchange_declare(
            "events",
            ExchangeKind::Topic,
            ExchangeOptions {
                durable: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        durable_queue(&ch, "all").await;
        durable_queue(&ch, "eu").await;
        ch.queue_bind("all", "orders.#", "events").await.unwrap();
        ch.queue_bind("eu", "orders.*.eu", "events").await.unwrap();

        ch.basic_publish("events", "orders.paid.eu", publishing("x"))
            .await
            .unwrap();
        ch.basic_publish("events", "orders.paid.us", publishing("y"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("all"), 2);
        assert_eq!(broker.queue_depth("eu"), 1);
    }

    #[tokio::test]
    async fn test_exchange_redeclare_with_other_kind_fails() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        ch.exchange_declare("events", ExchangeKind::Topic, ExchangeOptions::default())
            .await
            .unwrap();
        let err = ch
            .exchange_declare("events", ExchangeKind::Fanout, ExchangeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        durable_queue(&ch, "jobs").await;
        let opts = ConsumeOptions { auto_ack: true };
        let mut a = ch.basic_consume("jobs", "a", opts).await.unwrap();
        let mut b = ch.basic_consume("jobs", "b", opts).await.unwrap();

        for body in ["1", "2", "3", "4"] {
            ch.basic_publish("", "jobs", publishing(body)).await.unwrap();
        }

        let mut got_a = 0;
        while a.try_recv().is_ok() {
            got_a += 1;
        }
        let mut got_b = 0;
        while b.try_recv().is_ok() {
            got_b += 1;
        }
        assert_eq!((got_a, got_b), (2, 2));
    }

    /// Тест проверяет, что неподтверждённое сообщение возвращается в очередь
    /// при разрыве соединения и доставляется повторно.
    #[tokio::test]
    async fn test_unacked_requeued_on_disconnect() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "first").await.unwrap();
        durable_queue(&ch, "jobs").await;
        let mut rx = ch
            .basic_consume("jobs", "c", ConsumeOptions::default())
            .await
            .unwrap();
        ch.basic_publish("", "jobs", publishing("acked")).await.unwrap();
        ch.basic_publish("", "jobs", publishing("pending"))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        ch.basic_ack(first.delivery_tag).await.unwrap();
        let _second = rx.recv().await.unwrap();

        broker.disconnect_all();
        assert!(ch.is_closed());
        ch.closed().await;
        assert!(matches!(
            ch.basic_publish("", "jobs", publishing("late")).await,
            Err(TransportError::ChannelClosed)
        ));

        let ch2 = broker.dial("amqp://mem", "second").await.unwrap();
        let mut rx2 = ch2
            .basic_consume("jobs", "c", ConsumeOptions::default())
            .await
            .unwrap();
        let again = rx2.recv().await.unwrap();
        assert_eq!(again.body, Bytes::from_static(b"pending"));
        assert!(again.redelivered);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        let name = ch
            .queue_declare(
                "",
                QueueOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.has_queue(&name));

        ch.close().await.unwrap();
        assert!(!broker.has_queue(&name));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_dial() {
        let broker = MemoryExchangeBroker::new();
        broker.set_reachable(false);
        let err = broker.dial("amqp://mem", "t").await.err().unwrap();
        assert!(matches!(err, TransportError::Unreachable { .. }));

        broker.set_reachable(true);
        assert!(broker.dial("amqp://mem", "t").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_delivery_tag_is_rejected() {
        let broker = MemoryExchangeBroker::new();
        let ch = broker.dial("amqp://mem", "t").await.unwrap();
        assert!(ch.basic_ack(42).await.is_err());
    }
}
