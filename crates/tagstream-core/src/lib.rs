//! TagStream Core
//!
//! Core types shared across TagStream components.
//!
//! This crate provides:
//! - Sparse token-frequency vectors for cached items
//! - Token pools that aggregate frequencies over sets of items
//! - Feed metadata
//! - Error types and result handling
//! - HMAC request signing and verification

pub mod auth;
pub mod error;
pub mod item;
pub mod token;

pub use auth::{Credentials, RequestParts};
pub use error::{Error, Result};
pub use item::{Feed, FeedId, Item, ItemId};
pub use token::{Token, TokenId, TokenPool};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::item::{Feed, Item, ItemId};
    pub use crate::token::{Token, TokenId, TokenPool};
}
