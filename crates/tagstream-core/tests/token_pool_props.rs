//! Property tests for token pool accumulation

use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeMap;
use tagstream_core::{Item, TokenPool};

fn arb_items() -> impl Strategy<Value = Vec<Vec<(u32, u64)>>> {
    prop::collection::vec(
        prop::collection::vec((1u32..5_000, 1u64..50), 0..40),
        0..20,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_totals_match_items(raw in arb_items()) {
        let items: Vec<Item> = raw
            .iter()
            .enumerate()
            .map(|(i, tokens)| Item::new(i as u64 + 1, Utc::now(), tokens.iter().copied()).unwrap())
            .collect();
        let pool: TokenPool = items.iter().collect();

        let expected_total: u64 = items.iter().map(|i| i.total_tokens()).sum();
        prop_assert_eq!(pool.total_tokens(), expected_total);

        let mut expected: BTreeMap<u32, u64> = BTreeMap::new();
        for tokens in &raw {
            for (id, freq) in tokens {
                *expected.entry(*id).or_insert(0) += freq;
            }
        }
        for (id, freq) in &expected {
            prop_assert_eq!(pool.token_frequency(*id), *freq);
        }
        prop_assert_eq!(pool.num_tokens(), expected.len());
    }

    #[test]
    fn prop_next_token_visits_each_id_once_ascending(raw in arb_items()) {
        let items: Vec<Item> = raw
            .iter()
            .enumerate()
            .map(|(i, tokens)| Item::new(i as u64 + 1, Utc::now(), tokens.iter().copied()).unwrap())
            .collect();
        let pool: TokenPool = items.iter().collect();

        let mut cursor = 0;
        let mut count = 0;
        while let Some(token) = pool.next_token(cursor) {
            prop_assert!(token.id > cursor);
            cursor = token.id;
            count += 1;
        }
        prop_assert_eq!(count, pool.num_tokens());
    }
}
