//! Cached items and feeds

use crate::error::{Error, Result};
use crate::token::{Token, TokenId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Item identifier, positive and unique within a store
pub type ItemId = u64;

/// Feed identifier
pub type FeedId = u64;

/// Immutable token-frequency vector for one content entry.
///
/// Tokens are kept sorted by id so lookups are a binary search over a
/// contiguous slice.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    id: ItemId,
    updated: DateTime<Utc>,
    total_tokens: u64,
    tokens: Box<[Token]>,
}

impl Item {
    /// Build an item from (token id, frequency) pairs.
    ///
    /// Repeated token ids are merged and zero frequencies dropped. Token id 0
    /// and item id 0 are rejected.
    pub fn new(
        id: ItemId,
        updated: DateTime<Utc>,
        tokens: impl IntoIterator<Item = (TokenId, u64)>,
    ) -> Result<Self> {
        if id == 0 {
            return Err(Error::validation("item id must be positive"));
        }

        let mut pairs: Vec<(TokenId, u64)> = tokens.into_iter().filter(|(_, f)| *f > 0).collect();
        if pairs.iter().any(|(token, _)| *token == 0) {
            return Err(Error::validation(format!("item {id} uses reserved token id 0")));
        }
        pairs.sort_unstable_by_key(|(token, _)| *token);

        let mut merged: Vec<Token> = Vec::with_capacity(pairs.len());
        for (token, frequency) in pairs {
            match merged.last_mut() {
                Some(last) if last.id == token => last.frequency += frequency,
                _ => merged.push(Token::new(token, frequency)),
            }
        }

        let total_tokens = merged.iter().map(|t| t.frequency).sum();
        Ok(Self {
            id,
            updated,
            total_tokens,
            tokens: merged.into_boxed_slice(),
        })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Time the underlying entry was last updated
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Sum of token frequencies
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Number of distinct tokens
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Tokens in ascending id order
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn token_frequency(&self, id: TokenId) -> u64 {
        self.tokens
            .binary_search_by_key(&id, |t| t.id)
            .map(|idx| self.tokens[idx].frequency)
            .unwrap_or(0)
    }

    /// First token with an id strictly greater than `cursor`; 0 starts a scan
    pub fn next_token(&self, cursor: TokenId) -> Option<Token> {
        let idx = self.tokens.partition_point(|t| t.id <= cursor);
        self.tokens.get(idx).copied()
    }
}

/// Feed metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    #[serde(default)]
    pub title: String,
}

impl Feed {
    pub fn new(id: FeedId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_merges_duplicate_tokens() {
        let item = Item::new(7, Utc::now(), vec![(3, 1), (1, 2), (3, 4), (8, 0)]).unwrap();
        assert_eq!(item.id(), 7);
        assert_eq!(item.num_tokens(), 2);
        assert_eq!(item.total_tokens(), 7);
        assert_eq!(item.token_frequency(3), 5);
        assert_eq!(item.token_frequency(8), 0);
    }

    #[test]
    fn test_item_rejects_reserved_ids() {
        assert!(matches!(
            Item::new(0, Utc::now(), vec![(1, 1)]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            Item::new(1, Utc::now(), vec![(0, 1)]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_item_next_token() {
        let item = Item::new(1, Utc::now(), vec![(10, 1), (4, 2), (99, 3)]).unwrap();
        assert_eq!(item.next_token(0), Some(Token::new(4, 2)));
        assert_eq!(item.next_token(4), Some(Token::new(10, 1)));
        assert_eq!(item.next_token(50), Some(Token::new(99, 3)));
        assert_eq!(item.next_token(99), None);
    }
}
