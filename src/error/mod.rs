//! Ошибки крейта.
//!
//! Таксономия очереди и транспорта живёт в `courier-error` и
//! переэкспортируется отсюда. Здесь только ошибки загрузки настроек.

use thiserror::Error;

pub use courier_error::*;

/// Ошибки загрузки и проверки [`Settings`](crate::config::Settings).
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Источник не прочитан или не десериализован
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    /// Значение прочитано, но не проходит проверку
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    pub fn invalid(
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Имя поля, не прошедшего проверку.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { field, .. } => Some(field),
            Self::Load(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_reports_field() {
        let err = SettingsError::invalid("service_name", "must not be empty");
        assert_eq!(err.field(), Some("service_name"));
        assert_eq!(
            err.to_string(),
            "invalid setting 'service_name': must not be empty"
        );
    }

    #[test]
    fn test_from_config_error() {
        let err: SettingsError = config::ConfigError::Message("boom".into()).into();
        assert!(err.field().is_none());
        assert!(err.to_string().contains("boom"));
    }
}
