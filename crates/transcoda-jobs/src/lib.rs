//! # transcoda-jobs
//!
//! Conversion workers for transcoda.
//!
//! This crate provides:
//! - [`ConversionLimiter`]: bounds concurrent encoder runs
//! - [`CommandEncoder`]: runs the external encoder (ffmpeg by default)
//! - [`Converter`]: drives one request through its state machine
//! - [`QueueWorker`]: consumes the queue and runs jobs with graceful drain
//! - [`Submitter`]: records a request and enqueues its job
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use transcoda_jobs::*;
//!
//! let converter = Arc::new(Converter::new(store, objects, encoder, ConverterConfig::from_env()));
//! let worker = QueueWorker::new(queue, converter, ConversionLimiter::from_env(), WorkerConfig::from_env());
//! let handle = worker.start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown();
//! handle.join().await?;
//! ```

pub mod converter;
pub mod encoder;
pub mod limiter;
pub mod submit;
pub mod worker;

// Re-export core types
pub use transcoda_core::*;

pub use converter::{Converter, ConverterConfig, ProcessOutcome};
pub use encoder::{CommandEncoder, EncoderConfig};
pub use limiter::{ConversionLimiter, ConversionPermit};
pub use submit::{SubmitRequest, Submitter};
pub use worker::{QueueWorker, WorkerConfig, WorkerEvent, WorkerHandle};
