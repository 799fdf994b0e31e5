use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use courier_error::QueueError;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, trace};

use super::{
    connection::{ClientOptions, ConnectionManager},
    Backend, ConnectionState, Publisher, Queue, Subscriber, Subscription,
};
use crate::telemetry::{Context, Tracer};

/// Клиент очереди поверх конкретного бэкенда.
///
/// Публикация, подписка и запрос–ответ с распространением контекста трассы,
/// автоматическим переподключением и восстановлением подписок.
pub struct QueueClient<B: Backend> {
    manager: Arc<ConnectionManager<B>>,
}

impl<B: Backend> QueueClient<B> {
    /// Подключается к брокеру. Ошибка подключения или объявления топологии
    /// возвращается как [`QueueError::Connection`].
    pub async fn connect(
        backend: B,
        tracer: Arc<dyn Tracer>,
        options: ClientOptions,
    ) -> Result<Self, QueueError> {
        let manager = ConnectionManager::start(backend, tracer, options).await?;
        Ok(Self { manager })
    }

    pub fn backend(&self) -> &B {
        self.manager.backend()
    }

    pub fn options(&self) -> &ClientOptions {
        self.manager.options()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Наблюдатель за сменой состояний соединения.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    /// Топики, у которых сейчас работает потребитель; по записи на
    /// потребителя, в порядке регистрации.
    pub async fn active_consumers(&self) -> Vec<String> {
        self.manager.active_consumers().await
    }

    /// Ждёт состояния `Connected` не дольше `timeout`.
    pub async fn wait_connected(
        &self,
        timeout: Duration,
    ) -> bool {
        let mut changes = self.state_changes();
        let outcome = tokio::time::timeout(
            timeout,
            changes.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .map(|changed| changed.is_ok());
        outcome.unwrap_or(false)
    }

    fn live_handle(
        &self,
        topic: &str,
    ) -> Result<B::Handle, QueueError> {
        if self.manager.is_closing() {
            return Err(QueueError::Closed);
        }
        self.manager
            .current()
            .ok_or_else(|| QueueError::publish(topic, "connection is not available"))
    }

    fn request_deadline(
        &self,
        ctx: &Context,
    ) -> Instant {
        let ceiling = Instant::now() + self.options().request_timeout;
        ctx.deadline().map_or(ceiling, |deadline| deadline.min(ceiling))
    }
}

#[async_trait]
impl<B: Backend> Publisher for QueueClient<B> {
    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
        body: Bytes,
    ) -> Result<(), QueueError> {
        let handle = self.live_handle(topic)?;
        self.manager
            .backend()
            .publish(&handle, self.manager.tracer(), ctx, topic, body, None)
            .await?;
        trace!(topic, "message published");
        Ok(())
    }

    async fn request(
        &self,
        ctx: &Context,
        topic: &str,
        body: Bytes,
    ) -> Result<Bytes, QueueError> {
        let handle = self.live_handle(topic)?;
        let deadline = self.request_deadline(ctx);
        let backend = self.manager.backend();

        let mut inbox = backend.open_reply_inbox(&handle).await?;
        let published = backend
            .publish(
                &handle,
                self.manager.tracer(),
                ctx,
                topic,
                body,
                Some(inbox.address.as_str()),
            )
            .await;
        if let Err(err) = published {
            backend.close_reply_inbox(&handle, inbox).await;
            return Err(err);
        }

        let started = Instant::now();
        let mut shutdown = self.manager.shutdown_signal();
        let outcome = tokio::select! {
            reply = inbox.deliveries.next() => match reply {
                Some(delivery) => Ok(delivery.message().into_body()),
                None => Err(QueueError::Cancelled { topic: topic.to_string() }),
            },
            _ = tokio::time::sleep_until(deadline) => Err(QueueError::Timeout {
                topic: topic.to_string(),
                after_ms: started.elapsed().as_millis() as u64,
            }),
            _ = ctx.cancelled() => Err(QueueError::Cancelled { topic: topic.to_string() }),
            _ = shutdown.wait_for(|closing| *closing) => Err(QueueError::Cancelled {
                topic: topic.to_string(),
            }),
        };

        backend.close_reply_inbox(&handle, inbox).await;
        if let Err(err) = &outcome {
            debug!(topic, error = %err, "request finished without reply");
        }
        outcome
    }
}

#[async_trait]
impl<B: Backend> Subscriber for QueueClient<B> {
    async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Subscription,
    ) -> Result<(), QueueError> {
        self.manager.subscribe(ctx, subscription).await
    }
}

#[async_trait]
impl<B: Backend> Queue for QueueClient<B> {
    async fn close(&self) -> Result<(), QueueError> {
        self.manager.close().await;
        Ok(())
    }
}

impl<B: Backend> Drop for QueueClient<B> {
    fn drop(&mut self) {
        self.manager.signal_shutdown();
    }
}
