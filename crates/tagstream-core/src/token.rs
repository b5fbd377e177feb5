//! Sparse token-frequency pools

use crate::item::Item;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Vocabulary token identifier. Id 0 is reserved as the start-of-scan cursor.
pub type TokenId = u32;

/// One (token, frequency) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub frequency: u64,
}

impl Token {
    pub fn new(id: TokenId, frequency: u64) -> Self {
        Self { id, frequency }
    }
}

/// Aggregated token frequencies over a set of items.
///
/// A vocabulary holds 10^4 to 10^6 distinct tokens while any one pool touches
/// a small scattered subset, so frequencies live in an ordered sparse map.
/// Pools are append-only and not meant to be mutated from several threads;
/// build disjoint pools in parallel and share the finished ones behind `Arc`.
#[derive(Debug, Clone, Default)]
pub struct TokenPool {
    tokens: BTreeMap<TokenId, u64>,
    total_tokens: u64,
    num_items: usize,
}

impl TokenPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate every token of `item` into the pool
    pub fn add_item(&mut self, item: &Item) {
        for token in item.tokens() {
            *self.tokens.entry(token.id).or_insert(0) += token.frequency;
            self.total_tokens += token.frequency;
        }
        self.num_items += 1;
    }

    /// Number of distinct tokens
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Sum of all frequencies
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Number of items added so far
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Cumulative frequency of `id`, zero when the pool never saw it
    pub fn token_frequency(&self, id: TokenId) -> u64 {
        self.tokens.get(&id).copied().unwrap_or(0)
    }

    /// First token with an id strictly greater than `cursor`.
    ///
    /// Passing 0 starts a scan; passing the previous token's id continues it.
    /// Each scan is independent, so several readers may walk the same pool.
    pub fn next_token(&self, cursor: TokenId) -> Option<Token> {
        self.tokens
            .range((Bound::Excluded(cursor), Bound::Unbounded))
            .next()
            .map(|(&id, &frequency)| Token { id, frequency })
    }

    /// All tokens in ascending id order
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.tokens
            .iter()
            .map(|(&id, &frequency)| Token { id, frequency })
    }
}

impl<'a> FromIterator<&'a Item> for TokenPool {
    fn from_iter<I: IntoIterator<Item = &'a Item>>(iter: I) -> Self {
        let mut pool = TokenPool::new();
        for item in iter {
            pool.add_item(item);
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(id: u64, tokens: &[(TokenId, u64)]) -> Item {
        Item::new(id, Utc::now(), tokens.iter().copied()).unwrap()
    }

    #[test]
    fn test_empty_pool() {
        let pool = TokenPool::new();
        assert_eq!(pool.num_tokens(), 0);
        assert_eq!(pool.total_tokens(), 0);
        assert_eq!(pool.next_token(0), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_add_items_accumulates() {
        let mut pool = TokenPool::new();
        pool.add_item(&item(1, &[(1, 2), (5, 1)]));
        pool.add_item(&item(2, &[(1, 3), (9, 4)]));

        assert_eq!(pool.num_items(), 2);
        assert_eq!(pool.num_tokens(), 3);
        assert_eq!(pool.total_tokens(), 10);
        assert_eq!(pool.token_frequency(1), 5);
        assert_eq!(pool.token_frequency(5), 1);
        assert_eq!(pool.token_frequency(9), 4);
    }

    #[test]
    fn test_unknown_token_frequency_is_zero() {
        let mut pool = TokenPool::new();
        pool.add_item(&item(1, &[(3, 1)]));
        assert_eq!(pool.token_frequency(4), 0);
        assert_eq!(pool.token_frequency(u32::MAX), 0);
    }

    #[test]
    fn test_next_token_scans_ascending() {
        let mut pool = TokenPool::new();
        pool.add_item(&item(1, &[(40, 1), (2, 7), (17, 3)]));

        let mut cursor = 0;
        let mut seen = Vec::new();
        while let Some(token) = pool.next_token(cursor) {
            seen.push((token.id, token.frequency));
            cursor = token.id;
        }
        assert_eq!(seen, vec![(2, 7), (17, 3), (40, 1)]);

        // A second scan starts over
        assert_eq!(pool.next_token(0).map(|t| t.id), Some(2));
    }
}
