//! Настройки клиента: значения по умолчанию, файл и переменные окружения.

pub mod settings;

pub use settings::{
    BackendKind, ExchangeSettings, Settings, StreamSettings, CONFIG_PATH_ENV, ENV_PREFIX,
};
