//! Kasane build execution
//!
//! This crate drives the container build engine: it turns compiled
//! build plans into engine calls, manages cache-busting and the
//! squash-result cache, stages files between images, and pushes the
//! final images to a registry.

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod progress;
pub mod pusher;
pub mod squash;
pub mod staging;

pub use context::create_context;
pub use engine::{BuildOpts, Engine, split_image_tag};
pub use error::{BuildError, Result};
pub use executor::{ExecuteOptions, Executor, FAILURE_DUMP};
pub use pusher::{extract_registry, push};
pub use staging::{StagedFile, cache_root, clear_copy_cache};
