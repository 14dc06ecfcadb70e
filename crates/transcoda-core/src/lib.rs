//! # transcoda-core
//!
//! Core types, traits, and abstractions for the transcoda conversion pipeline.
//!
//! This crate provides the request state machine, the queue payload, the
//! error taxonomy, and the collaborator traits that the database and jobs
//! crates implement and consume.

pub mod defaults;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod models;
pub mod staging;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;

#[cfg(any(test, feature = "mock"))]
pub use memory::{MemoryJobQueue, MemoryJobStore, MemoryObjectStore};
