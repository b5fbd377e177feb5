//! TagStream Engine
//!
//! Runs classification jobs against the item cache on a pool of worker
//! threads.
//!
//! This crate provides:
//! - `ClassificationJob` and its lifecycle states
//! - `ClassificationEngine`, the job queue and worker pool
//! - `TaggingPublisher` for sending results back to the tag's owner

pub mod engine;
pub mod job;
pub mod publisher;

pub use engine::{ClassificationEngine, EngineOptions};
pub use job::{ClassificationJob, JobSnapshot, JobState};
pub use publisher::{DiscardPublisher, HttpTaggingPublisher, Tagging, TaggingPublisher};
