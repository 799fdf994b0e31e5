//! Сопоставление имён топиков с шаблонами.
//!
//! Два диалекта:
//! - exchange (AMQP topic): `*` — ровно одно слово, `#` — ноль или больше слов;
//! - stream (subject): `*` — ровно один токен, `>` — один или больше токенов в
//!   хвосте.
//!
//! Разделитель слов в обоих случаях — точка.

/// Совпадает ли ключ маршрутизации с ключом привязки AMQP topic-обменника.
pub fn routing_key_matches(
    binding_key: &str,
    routing_key: &str,
) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(
    pattern: &[&str],
    words: &[&str],
) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => {
            // `#` поглощает от нуля до всех оставшихся слов
            (0..=words.len()).any(|skip| match_words(rest, &words[skip..]))
        }
        Some((&head, rest)) => match words.split_first() {
            Some((&word, tail)) if head == "*" || head == word => match_words(rest, tail),
            _ => false,
        },
    }
}

/// Совпадает ли subject с фильтром потокового брокера.
pub fn subject_matches(
    filter: &str,
    subject: &str,
) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(token)) if !token.is_empty() => continue,
            (Some(f), Some(s)) if f == s && !s.is_empty() => continue,
            _ => return false,
        }
    }
}

/// Пересекается ли фильтр потребителя хотя бы с одним subject'ом потока.
///
/// Фильтр допустим, если он сам совпадает с одним из шаблонов потока или
/// буквально равен ему.
pub fn filter_within(
    stream_subjects: &[String],
    filter: &str,
) -> bool {
    stream_subjects
        .iter()
        .any(|subject| subject == filter || subject_matches(subject, filter))
}

/// Является ли subject литералом без подстановочных токенов.
pub fn is_literal_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|token| !token.is_empty() && token != "*" && token != ">")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_routing_key_literal_and_star() {
        assert!(routing_key_matches("orders.ready", "orders.ready"));
        assert!(!routing_key_matches("orders.ready", "orders.ready.eu"));
        assert!(routing_key_matches("orders.*", "orders.ready"));
        assert!(!routing_key_matches("orders.*", "orders"));
        assert!(!routing_key_matches("orders.*", "orders.ready.eu"));
    }

    #[test]
    fn test_routing_key_hash() {
        assert!(routing_key_matches("#", "anything.at.all"));
        assert!(routing_key_matches("orders.#", "orders"));
        assert!(routing_key_matches("orders.#", "orders.ready.eu"));
        assert!(routing_key_matches("*.#.paid", "orders.eu.paid"));
        assert!(routing_key_matches("*.#.paid", "orders.paid"));
        assert!(!routing_key_matches("*.#.paid", "paid"));
    }

    #[test]
    fn test_subject_wildcards() {
        assert!(subject_matches("orders.*", "orders.ready"));
        assert!(!subject_matches("orders.*", "orders.ready.eu"));
        assert!(subject_matches("orders.>", "orders.ready.eu"));
        assert!(!subject_matches("orders.>", "orders"));
        assert!(subject_matches(">", "a"));
        assert!(!subject_matches("orders.ready", "orders.paid"));
        assert!(!subject_matches("a.*", "a."));
    }

    #[test]
    fn test_filter_within_stream() {
        let subjects = vec!["orders.*".to_string(), "partners".to_string()];
        assert!(filter_within(&subjects, "orders.ready"));
        assert!(filter_within(&subjects, "orders.*"));
        assert!(filter_within(&subjects, "partners"));
        assert!(!filter_within(&subjects, "products"));
    }

    #[test]
    fn test_literal_subject() {
        assert!(is_literal_subject("orders.ready"));
        assert!(!is_literal_subject("orders.*"));
        assert!(!is_literal_subject("orders..ready"));
        assert!(!is_literal_subject(""));
    }

    proptest! {
        /// Литеральный ключ всегда совпадает сам с собой в обоих диалектах.
        #[test]
        fn prop_literal_matches_itself(words in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let key = words.join(".");
            prop_assert!(routing_key_matches(&key, &key));
            prop_assert!(subject_matches(&key, &key));
        }

        /// `#` и `>` покрывают любой непустой ключ.
        #[test]
        fn prop_full_wildcards_match_everything(words in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let key = words.join(".");
            prop_assert!(routing_key_matches("#", &key));
            prop_assert!(subject_matches(">", &key));
        }

        /// Замена одного слова на `*` сохраняет совпадение.
        #[test]
        fn prop_star_replaces_one_word(
            words in prop::collection::vec("[a-z]{1,6}", 1..5),
            idx in 0usize..5,
        ) {
            let idx = idx % words.len();
            let key = words.join(".");
            let mut pattern = words.clone();
            pattern[idx] = "*".to_string();
            let pattern = pattern.join(".");
            prop_assert!(routing_key_matches(&pattern, &key));
            prop_assert!(subject_matches(&pattern, &key));
        }
    }
}
