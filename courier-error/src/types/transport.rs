use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки уровня брокера: то, что возвращает драйвер соединения.
///
/// Фасад очереди никогда не отдаёт их наружу напрямую: бэкенд
/// переводит их в [`QueueError`](crate::QueueError) с учётом операции.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker at {address} is unreachable")]
    Unreachable { address: String },

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("no responders for subject '{subject}'")]
    NoResponders { subject: String },

    #[error("unknown consumer '{consumer}'")]
    UnknownConsumer { consumer: String },

    /// Прочие отказы драйвера брокера
    #[error("broker error: {reason}")]
    Broker { reason: String },
}

impl TransportError {
    /// Является ли ошибка признаком потерянного соединения.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::ChannelClosed | Self::Unreachable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl ErrorExt for TransportError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unreachable { .. } => StatusCode::ConnectionFailed,
            Self::ConnectionClosed | Self::ChannelClosed => StatusCode::ConnectionClosed,
            Self::NotFound { .. } | Self::PreconditionFailed { .. } => StatusCode::TopologyFailed,
            Self::NoResponders { .. } => StatusCode::NoResponders,
            Self::UnknownConsumer { .. } | Self::Broker { .. } => StatusCode::ProtocolError,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::ConnectionClosed.is_disconnect());
        assert!(TransportError::Unreachable {
            address: "amqp://x".into()
        }
        .is_disconnect());
        assert!(!TransportError::NoResponders {
            subject: "a".into()
        }
        .is_disconnect());
    }

    #[test]
    fn test_not_found_display() {
        let err = TransportError::NotFound {
            kind: "stream",
            name: "ORDERS".into(),
        };
        assert_eq!(err.to_string(), "stream 'ORDERS' not found");
        assert_eq!(err.status_code(), StatusCode::TopologyFailed);
    }

    #[test]
    fn test_broker_error_is_not_disconnect() {
        let err = TransportError::Broker {
            reason: "frame too large".into(),
        };
        assert!(!err.is_disconnect());
        assert_eq!(err.status_code(), StatusCode::ProtocolError);
    }
}
