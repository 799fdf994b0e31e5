//! Узкий интерфейс ключ–значение, через который трассировщик пишет и читает
//! заголовки распространения контекста.
//!
//! Каждый бэкенд оборачивает свои нативные заголовки в собственную
//! реализацию [`TextMapCarrier`]; сами нативные типы наружу не выходят.

use std::collections::HashMap;

pub trait TextMapCarrier {
    /// Значение по ключу; `None`, если ключа нет или значение не строка.
    fn get(
        &self,
        key: &str,
    ) -> Option<&str>;
    /// Записывает значение, перезаписывая предыдущее.
    fn set(
        &mut self,
        key: &str,
        value: String,
    );
    /// Все ключи, присутствующие в носителе.
    fn keys(&self) -> Vec<&str>;
}

/// Простейший носитель поверх `HashMap`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapCarrier(pub HashMap<String, String>);

impl MapCarrier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextMapCarrier for MapCarrier {
    fn get(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn set(
        &mut self,
        key: &str,
        value: String,
    ) {
        self.0.insert(key.to_string(), value);
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
