//! TagStream Classifiers
//!
//! Tag models and the cache that serves them to classification workers.
//!
//! This crate provides:
//! - Parsing of Atom tag definition documents
//! - `Tagger`, a Bayesian model built from a tag's training examples
//! - `TagRetriever` and its HTTP implementation
//! - `TaggerCache`, a checkout-based cache with background fetching

pub mod definition;
pub mod retriever;
pub mod tagger;
pub mod tagger_cache;

pub use definition::TagDefinition;
pub use retriever::{HttpTagRetriever, TagRetriever};
pub use tagger::{Clue, Tagger};
pub use tagger_cache::{
    TaggerCache, TaggerHandle, TaggerLookup, TaggerState, DEFAULT_FAILED_TAG_LIMIT,
};
