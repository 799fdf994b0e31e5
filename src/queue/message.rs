use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::telemetry::{Context, SpanRef};

/// Входящее сообщение, которое видит обработчик.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Bytes,
    reply_to: String,
}

/// Обработчик сообщений одного топика.
///
/// Получает контекст с дочерним span'ом потребления, сам span и сообщение.
/// Ошибка записывается в span и не влияет на подтверждение.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: Context,
        span: SpanRef,
        message: Message,
    ) -> anyhow::Result<()>;
}

/// Обработчик из замыкания.
pub struct FnHandler<F>(F);

/// Зарегистрированный интерес к топику.
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub handler: Arc<dyn Handler>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            reply_to: String::new(),
        }
    }

    pub fn with_reply_to(
        mut self,
        reply_to: impl Into<String>,
    ) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    /// Тело сообщения как есть.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Адрес ответа; пустая строка, если ответ не ожидается.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn expects_reply(&self) -> bool {
        !self.reply_to.is_empty()
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, SpanRef, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: Context,
        span: SpanRef,
        message: Message,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, span, message).await
    }
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            handler,
        }
    }

    /// Подписка с обработчиком-замыканием.
    pub fn from_fn<F, Fut>(
        topic: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Context, SpanRef, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(topic, Arc::new(FnHandler(f)))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
