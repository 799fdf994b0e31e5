use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки конфигурации
/// - 6xxx: Сеть / транспорт брокера
/// - 7xxx: Ошибки обмена сообщениями (публикация, подписка, обработчики)
///
/// # Реализация:
/// - `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
/// - опционально: `strum` для `AsRefStr`/`EnumIter` (feature = "strum").
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unsupported = 1001,
    Internal = 1003,
    InvalidArgs = 1004,

    // === 2xxx: Конфигурация ===
    InvalidConfig = 2000,
    MissingConfig = 2001,

    // === 6xxx: Сеть/транспорт ===
    ConnectionClosed = 6001,
    Timeout = 6002,
    ProtocolError = 6003,
    ConnectionFailed = 6004,
    TopologyFailed = 6005,

    // === 7xxx: Обмен сообщениями ===
    PublishFailed = 7000,
    SubscribeFailed = 7001,
    CallbackFailed = 7002,
    QueueClosed = 7003,
    Cancelled = 7004,
    NoResponders = 7005,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    ///
    /// Использует `TryFrom<u32>` из `num_enum`; возвращает `None`, если
    /// значение не соответствует ни одному варианту.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с этим кодом имеет смысл повторить.
    ///
    /// Сюда попадают сбои на время переподключения: вызывающая сторона
    /// сама решает, повторять ли публикацию.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionClosed
                | Self::ConnectionFailed
                | Self::PublishFailed
                | Self::SubscribeFailed
                | Self::NoResponders
        )
    }

    /// Является ли код ошибкой транспорта (диапазон 6xxx).
    pub fn is_transport_error(&self) -> bool {
        (6000..=6999).contains(&self.code())
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::Cancelled | Self::QueueClosed => LogLevel::Debug,
            Self::InvalidArgs | Self::InvalidConfig | Self::MissingConfig => LogLevel::Info,
            Self::Timeout
            | Self::ConnectionClosed
            | Self::PublishFailed
            | Self::SubscribeFailed
            | Self::CallbackFailed
            | Self::NoResponders => LogLevel::Warn,
            Self::Internal | Self::ConnectionFailed | Self::TopologyFailed => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        // Если включён feature "strum", используем human-readable имя (AsRefStr).
        // Иначе — Debug-имя.
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}
