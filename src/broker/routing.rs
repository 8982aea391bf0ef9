/// Topic-exchange matching: words are separated by `.`, `*` matches exactly
/// one word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::topic_matches;

    #[rstest]
    #[case("logs.*.*", "logs.users_service.INFO", true)]
    #[case("logs.*.*", "logs.test.critical", true)]
    #[case("logs.*.*", "logs.users_service", false)]
    #[case("logs.*.*", "logs.a.b.c", false)]
    #[case("logs.*.*", "metrics.a.b", false)]
    #[case("dlq.logs.#", "dlq.logs", true)]
    #[case("dlq.logs.#", "dlq.logs.a", true)]
    #[case("dlq.logs.#", "dlq.logs.a.b.c", true)]
    #[case("dlq.logs.#", "dlq.other", false)]
    #[case("#", "", true)]
    #[case("#", "anything.at.all", true)]
    #[case("a.#.z", "a.z", true)]
    #[case("a.#.z", "a.b.c.z", true)]
    #[case("a.#.z", "a.b.c", false)]
    #[case("exact.key", "exact.key", true)]
    fn matches_like_a_topic_exchange(
        #[case] pattern: &str,
        #[case] key: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(topic_matches(pattern, key), expected);
    }
}
