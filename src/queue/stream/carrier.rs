use crate::{broker::stream::HeaderMap, telemetry::TextMapCarrier};

/// Носитель контекста поверх многозначных заголовков потокового брокера.
///
/// `get` возвращает первое значение ключа, `set` заменяет все значения одним.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCarrier(HeaderMap);

impl HeaderCarrier {
    pub fn new(headers: HeaderMap) -> Self {
        Self(headers)
    }

    pub fn into_inner(self) -> HeaderMap {
        self.0
    }
}

impl TextMapCarrier for HeaderCarrier {
    fn get(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn set(
        &mut self,
        key: &str,
        value: String,
    ) {
        self.0.insert(key.to_string(), vec![value]);
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
