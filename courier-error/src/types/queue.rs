use std::any::Any;

use crate::{ErrorExt, StatusCode, TransportError};

/// Ошибки фасада очереди (Publish / Subscribe / Request / Close).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Сбой транспорта, рукопожатия или объявления топологии
    Connection { reason: String },
    /// Канал непригоден для публикации
    Publish { topic: String, reason: String },
    /// Не удалось объявить или привязать топик при подписке
    Subscribe { topic: String, reason: String },
    /// Ошибка бизнес-обработчика; только записывается в span
    Callback { topic: String, reason: String },
    /// Операция после `close()`
    Closed,
    /// Ответ на запрос не пришёл до дедлайна
    Timeout { topic: String, after_ms: u64 },
    /// Запрос отменён вызывающей стороной или закрытием очереди
    Cancelled { topic: String },
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl QueueError {
    pub fn connection(reason: impl ToString) -> Self {
        Self::Connection {
            reason: reason.to_string(),
        }
    }

    pub fn publish(
        topic: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn subscribe(
        topic: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn callback(
        topic: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Callback {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Операция отклонена, потому что очередь закрыта.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Запрос завершился по дедлайну или отмене.
    pub fn is_timeout_or_cancelled(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::Connection { reason } => write!(f, "Connection error: {reason}"),
            Self::Publish { topic, reason } => {
                write!(f, "Publish to '{topic}' failed: {reason}")
            }
            Self::Subscribe { topic, reason } => {
                write!(f, "Subscribe to '{topic}' failed: {reason}")
            }
            Self::Callback { topic, reason } => {
                write!(f, "Callback for '{topic}' failed: {reason}")
            }
            Self::Closed => write!(f, "Queue is closed"),
            Self::Timeout { topic, after_ms } => {
                write!(f, "Request to '{topic}' timed out after {after_ms}ms")
            }
            Self::Cancelled { topic } => write!(f, "Request to '{topic}' was cancelled"),
        }
    }
}

impl std::error::Error for QueueError {}

impl ErrorExt for QueueError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Connection { .. } => StatusCode::ConnectionFailed,
            Self::Publish { .. } => StatusCode::PublishFailed,
            Self::Subscribe { .. } => StatusCode::SubscribeFailed,
            Self::Callback { .. } => StatusCode::CallbackFailed,
            Self::Closed => StatusCode::QueueClosed,
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Cancelled { .. } => StatusCode::Cancelled,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::Connection { .. } => "Broker connection unavailable".to_string(),
            Self::Publish { topic, .. } => format!("Could not publish to {topic}"),
            Self::Subscribe { topic, .. } => format!("Could not subscribe to {topic}"),
            Self::Callback { .. } => "Message handler failed".to_string(),
            Self::Closed => "Queue closed".to_string(),
            Self::Timeout { .. } => "Request timeout".to_string(),
            Self::Cancelled { .. } => "Request cancelled".to_string(),
        }
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "queue".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::Publish { topic, .. }
            | Self::Subscribe { topic, .. }
            | Self::Callback { topic, .. }
            | Self::Timeout { topic, .. }
            | Self::Cancelled { topic } => {
                tags.push(("topic", topic.clone()));
            }
            _ => {}
        }

        tags
    }
}

/// Ошибка транспорта при установке соединения становится `Connection`.
impl From<TransportError> for QueueError {
    fn from(err: TransportError) -> Self {
        QueueError::connection(err)
    }
}
