//! TagStream Store
//!
//! Persistent item store for the classification server.
//!
//! This crate provides:
//! - An append-only, versioned journal on disk
//! - `ItemCache`, the in-memory index of items and feeds built from it
//! - Atom entry and feed parsing
//! - Tokenization of entry content into vocabulary ids

pub mod atom;
pub mod item_cache;
pub mod journal;
pub mod tokenizer;

pub use atom::{Element, Entry, ParseError};
pub use item_cache::{ItemCache, ItemCacheOptions, RemoveOutcome};
pub use journal::SCHEMA_VERSION;
