use crate::{
    broker::exchange::{FieldTable, FieldValue},
    telemetry::TextMapCarrier,
};

/// Носитель контекста поверх таблицы заголовков AMQP.
///
/// Читаются только строковые значения; остальные типы для трассировщика
/// невидимы, но остаются в таблице.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableCarrier(FieldTable);

impl TableCarrier {
    pub fn new(table: FieldTable) -> Self {
        Self(table)
    }

    pub fn into_inner(self) -> FieldTable {
        self.0
    }
}

impl TextMapCarrier for TableCarrier {
    fn get(
        &self,
        key: &str,
    ) -> Option<&str> {
        match self.0.get(key) {
            Some(FieldValue::LongString(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn set(
        &mut self,
        key: &str,
        value: String,
    ) {
        self.0
            .insert(key.to_string(), FieldValue::LongString(value));
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
