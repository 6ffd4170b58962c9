//! # docqa core
//!
//! Runtime-agnostic building blocks of the retrieval pipeline: the
//! sliding-window splitter, the exact L2 vector index, the keyed index
//! registry, prompt construction, and the cumulative streaming adaptor.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. Model
//! backends, the session coordinator and the HTTP server live in the
//! `docqa` application crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod prompt;
pub mod registry;
pub mod stream;

pub use error::{PipelineError, Result};
