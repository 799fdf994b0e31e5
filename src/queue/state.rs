use std::fmt;

use serde::Serialize;

/// Состояние соединения, которое наблюдают вызывающие.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Идёт установка соединения
    Connecting,
    /// Соединение и топология готовы, все подписки обслуживаются
    Connected,
    /// Соединение потеряно, идёт ожидание перед повтором
    Disconnected,
    /// Вызван `close()`; новые операции отклоняются
    Draining,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
