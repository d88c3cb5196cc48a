//! Topic routing-key matching
//!
//! Routing keys are dot-separated words. Binding patterns may use:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! # Examples
//! - `User.*` matches `User.UserCreated`
//! - `User.#` matches `User`, `User.UserCreated` and `User.a.b`
//! - `*.UserCreated` does NOT match `UserCreated` (one word is required)

/// Check whether `routing_key` matches the binding `pattern`
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

/// Word-by-word match, one row per pattern word from the end
///
/// `next[j]` holds whether the remaining pattern matches `key[j..]`.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let mut next = vec![false; key.len() + 1];
    next[key.len()] = true;
    for word in pattern.iter().rev() {
        let mut current = vec![false; key.len() + 1];
        for j in (0..=key.len()).rev() {
            let has_word = j < key.len();
            current[j] = match *word {
                // `#` may swallow any number of words, including none
                "#" => next[j] || (has_word && current[j + 1]),
                "*" => has_word && next[j + 1],
                literal => has_word && key[j] == literal && next[j + 1],
            };
        }
        next = current;
    }
    next[0]
}

/// Translate a topic binding pattern into a NATS subject filter under `prefix`
///
/// NATS only supports a trailing multi-word wildcard (`>`, one or more words),
/// so `#` is accepted only as the last word. A pattern that is just `#` maps to
/// `{prefix}.>`. Returns `None` for patterns NATS cannot express.
///
/// Unlike `#`, `>` never matches zero words: `User.#` becomes `User.>`, which
/// does not match the bare key `User`.
pub fn to_nats_filter(prefix: &str, pattern: &str) -> Option<String> {
    let words: Vec<&str> = pattern.split('.').collect();
    let mut out = Vec::with_capacity(words.len() + 1);
    out.push(prefix.to_string());
    for (idx, word) in words.iter().enumerate() {
        if *word == "#" {
            if idx != words.len() - 1 {
                return None;
            }
            out.push(">".to_string());
        } else {
            out.push((*word).to_string());
        }
    }
    Some(out.join("."))
}
