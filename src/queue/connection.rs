//! Менеджер соединения: единственный владелец ручки соединения.
//!
//! Ручку пишут только конструктор (до запуска монитора) и задача-монитор.
//! Монитор ждёт сигнала о закрытии соединения, после чего снимает
//! потребителей, выжидает фиксированную паузу и переподключается без
//! ограничения числа попыток. После успешного подключения потребители
//! запускаются заново для каждой подписки реестра в порядке регистрации.
//!
//! Прежние потребители останавливаются до запуска новых, поэтому доставки
//! одной подписки никогда не обрабатываются параллельно.

use std::{sync::Arc, time::Duration};

use courier_error::QueueError;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use super::{
    consumer::run_consumer,
    log_queue_error,
    registry::{ConsumerTask, Registry},
    Backend, ConnectionState, DeliveryStream, Subscription,
};
use crate::telemetry::{Context, Tracer};

pub(crate) const RECONNECT_SPAN: &str = "queue.reconnect";
pub(crate) const SUBSCRIBE_SPAN: &str = "queue.subscribe";

/// Параметры поведения клиента, общие для всех бэкендов.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Имя сервиса: идентичность соединения и ресурс span'ов
    pub service_name: String,
    /// Пауза перед каждой попыткой переподключения
    pub reconnect_delay: Duration,
    /// Верхняя граница ожидания ответа на запрос
    pub request_timeout: Duration,
    /// Сколько ждать остановки потребителя при закрытии
    pub shutdown_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            reconnect_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub(crate) struct ConnectionManager<B: Backend> {
    backend: B,
    tracer: Arc<dyn Tracer>,
    options: ClientOptions,
    handle: RwLock<Option<B::Handle>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    /// Монитор закончил остановку потребителей и закрыл соединение
    drained: watch::Sender<bool>,
    registry: tokio::sync::Mutex<Registry>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> ConnectionManager<B> {
    /// Подключается и запускает монитор. Ошибка подключения фатальна.
    pub async fn start(
        backend: B,
        tracer: Arc<dyn Tracer>,
        options: ClientOptions,
    ) -> Result<Arc<Self>, QueueError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        let (drained, _) = watch::channel(false);

        let manager = Arc::new(Self {
            backend,
            tracer,
            options,
            handle: RwLock::new(None),
            state,
            shutdown,
            drained,
            registry: tokio::sync::Mutex::new(Registry::default()),
            monitor: Mutex::new(None),
        });

        let handle = match manager.backend.connect().await {
            Ok(handle) => handle,
            Err(err) => {
                manager.state.send_replace(ConnectionState::Disconnected);
                warn!(
                    backend = manager.backend.kind(),
                    service = %manager.options.service_name,
                    error = %err,
                    "initial connection failed"
                );
                return Err(err);
            }
        };

        *manager.handle.write() = Some(handle);
        manager.set_state(ConnectionState::Connected);
        info!(
            backend = manager.backend.kind(),
            service = %manager.options.service_name,
            "connected to broker"
        );

        let monitor = tokio::spawn(manager.clone().monitor());
        *manager.monitor.lock() = Some(monitor);
        Ok(manager)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tracer(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Текущая ручка, если соединение открыто.
    pub fn current(&self) -> Option<B::Handle> {
        self.handle
            .read()
            .clone()
            .filter(|handle| self.backend.is_open(handle))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// `Draining` терминально: после него состояние не меняется.
    fn set_state(
        &self,
        next: ConnectionState,
    ) {
        let changed = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Draining || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = %next, backend = self.backend.kind(), "connection state changed");
        }
    }

    /// Регистрирует подписку и, если соединение открыто, запускает её
    /// потребителя.
    pub async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Subscription,
    ) -> Result<(), QueueError> {
        let subscription = Arc::new(subscription);
        let mut registry = self.registry.lock().await;
        if self.is_closing() {
            return Err(QueueError::Closed);
        }

        let (_ctx, span) = self.tracer.start_from_context(ctx, SUBSCRIBE_SPAN);
        span.set_attribute("messaging.destination", subscription.topic.clone());

        match self.current() {
            Some(handle) => {
                let opened = self
                    .backend
                    .open_consumer(&handle, &subscription.topic)
                    .await;
                let deliveries = match opened {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        span.record_error(&err);
                        span.end();
                        return Err(err);
                    }
                };
                let id = registry.register(subscription.clone());
                let consumer = self.spawn_consumer(subscription, deliveries);
                if let Some(previous) = registry.attach(id, consumer) {
                    previous.stop().await;
                }
            }
            None => {
                debug!(
                    topic = %subscription.topic,
                    "not connected, consumer will start after reconnect"
                );
                registry.register(subscription);
            }
        }
        span.end();
        Ok(())
    }

    pub async fn active_consumers(&self) -> Vec<String> {
        self.registry.lock().await.active_topics()
    }

    /// Запрашивает закрытие и ждёт, пока монитор всё остановит.
    ///
    /// Каждый вызов, в том числе параллельный, возвращается только после
    /// остановки всех потребителей и закрытия соединения.
    pub async fn close(&self) {
        if !self.shutdown.send_replace(true) {
            self.state.send_replace(ConnectionState::Draining);
            info!(service = %self.options.service_name, "closing queue");
        }

        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!(error = %err, "connection monitor ended abnormally");
                self.drained.send_replace(true);
            }
        }

        let mut drained = self.drained.subscribe();
        if drained.wait_for(|done| *done).await.is_err() {
            debug!("drain signal dropped");
        }
    }

    /// Сигнал закрытия без ожидания; используется при drop клиента.
    pub fn signal_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            self.state.send_replace(ConnectionState::Draining);
        }
    }

    fn spawn_consumer(
        &self,
        subscription: Arc<Subscription>,
        deliveries: Box<dyn DeliveryStream>,
    ) -> ConsumerTask {
        let topic = subscription.topic.clone();
        let tracer = self.tracer.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            run_consumer(subscription, deliveries, tracer, shutdown).await;
        });
        ConsumerTask { topic, handle }
    }

    async fn monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let Some(handle) = self.handle.read().clone() else {
                break;
            };

            tokio::select! {
                _ = shutdown.wait_for(|closing| *closing) => break,
                _ = self.backend.closed(&handle) => {}
            }
            drop(handle);

            if self.is_closing() || !self.recover(&mut shutdown).await {
                break;
            }
        }

        self.drain().await;
        self.drained.send_replace(true);
        debug!(backend = self.backend.kind(), "connection monitor stopped");
    }

    /// Один цикл восстановления. `false`, если во время него пришёл сигнал
    /// закрытия.
    async fn recover(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let (_ctx, span) = self
            .tracer
            .start_from_context(&Context::background(), RECONNECT_SPAN);
        span.set_attribute("messaging.system", self.backend.kind().to_string());
        warn!(
            backend = self.backend.kind(),
            service = %self.options.service_name,
            "connection lost, reconnecting"
        );

        self.drop_connection().await;

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            tokio::select! {
                _ = shutdown.wait_for(|closing| *closing) => {
                    span.end();
                    return false;
                }
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.wait_for(|closing| *closing) => {
                    span.end();
                    return false;
                }
                result = self.backend.connect() => result,
            };

            let restored = match connected {
                Ok(handle) => self.restore(handle).await,
                Err(err) => Err(err),
            };

            match restored {
                Ok(subscriptions) => {
                    span.set_attribute("reconnect.attempts", attempt.to_string());
                    info!(
                        backend = self.backend.kind(),
                        attempt,
                        subscriptions,
                        "reconnected"
                    );
                    span.end();
                    return true;
                }
                Err(err) => {
                    span.record_error(&err);
                    log_queue_error(&err, &format!("reconnect attempt {attempt} failed"));
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Снимает потребителей и закрывает потерянное соединение.
    async fn drop_connection(&self) {
        let (handle, tasks) = {
            let mut registry = self.registry.lock().await;
            let handle = self.handle.write().take();
            self.set_state(ConnectionState::Disconnected);
            (handle, registry.detach_all())
        };

        for task in tasks {
            task.stop().await;
        }
        if let Some(handle) = handle {
            self.backend.teardown(handle).await;
        }
    }

    /// Поднимает потребителей всех подписок на новом соединении.
    ///
    /// Соединение публикуется только если все потребители открылись; иначе
    /// оно закрывается и попытка считается неудачной.
    async fn restore(
        &self,
        handle: B::Handle,
    ) -> Result<usize, QueueError> {
        let mut registry = self.registry.lock().await;
        if self.is_closing() {
            self.backend.teardown(handle).await;
            return Err(QueueError::Closed);
        }

        let entries = registry.entries();
        let mut opened = Vec::with_capacity(entries.len());
        for (id, subscription) in entries {
            match self
                .backend
                .open_consumer(&handle, &subscription.topic)
                .await
            {
                Ok(deliveries) => opened.push((id, subscription, deliveries)),
                Err(err) => {
                    drop(opened);
                    self.backend.teardown(handle).await;
                    return Err(err);
                }
            }
        }

        *self.handle.write() = Some(handle);
        let restored = opened.len();
        for (id, subscription, deliveries) in opened {
            let consumer = self.spawn_consumer(subscription, deliveries);
            if let Some(previous) = registry.attach(id, consumer) {
                previous.stop().await;
            }
        }
        self.set_state(ConnectionState::Connected);
        Ok(restored)
    }

    /// Останавливает потребителей и закрывает соединение при закрытии
    /// очереди.
    async fn drain(&self) {
        let (handle, tasks) = {
            let mut registry = self.registry.lock().await;
            (self.handle.write().take(), registry.detach_all())
        };

        let deadline = Instant::now() + self.options.shutdown_grace;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task.handle)
                .await
                .is_err()
            {
                warn!(topic = %task.topic, "consumer did not stop in time, aborting");
                task.stop().await;
            }
        }

        if let Some(handle) = handle {
            self.backend.teardown(handle).await;
        }
        info!(service = %self.options.service_name, "queue closed");
    }
}
