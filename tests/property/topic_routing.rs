// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Topic Matching

use cim_messaging::broker::topic::{matches, to_nats_filter};
use proptest::prelude::*;

fn routing_key() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Za-z0-9_-]{1,8}", 1..6)
}

proptest! {
    #[test]
    fn prop_key_matches_itself(words in routing_key()) {
        let key = words.join(".");
        prop_assert!(matches(&key, &key));
    }

    #[test]
    fn prop_hash_matches_everything(words in routing_key()) {
        prop_assert!(matches("#", &words.join(".")));
    }

    #[test]
    fn prop_star_replaces_exactly_one_word(words in routing_key(), idx in any::<prop::sample::Index>()) {
        let key = words.join(".");
        let mut pattern = words.clone();
        pattern[idx.index(words.len())] = "*".to_string();
        prop_assert!(matches(&pattern.join("."), &key));

        // one word longer never matches a star-only pattern of the original length
        let longer = format!("{}.extra", key);
        prop_assert!(!matches(&pattern.join("."), &longer));
    }

    #[test]
    fn prop_trailing_hash_translates_for_nats(words in routing_key()) {
        let pattern = format!("{}.#", words.join("."));
        let filter = to_nats_filter("events", &pattern);
        prop_assert_eq!(filter, Some(format!("events.{}.>", words.join("."))));
    }
}
