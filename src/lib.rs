//! # docqa
//!
//! Retrieval-augmented question answering over a single document.
//!
//! A document is split into overlapping chunks, each chunk is embedded, and
//! the vectors are indexed for exact nearest-neighbour search. A question is
//! embedded with the same model, the closest chunks become the context of a
//! prompt, and a generation backend answers from that context, in one piece
//! or streamed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//! │ extract  │──▶│  chunk    │──▶│ Embedder │──▶│ Registry  │
//! │ PDF/DOCX │   │ (window)  │   │ (cached) │   │ key→index │
//! └──────────┘   └───────────┘   └──────────┘   └─────┬─────┘
//!                                                     │ top-k
//!                ┌───────────┐   ┌───────────┐        ▼
//!                │  Session  │◀──│ Generator │◀── context + question
//!                │ ask/stream│   │ (backend) │
//!                └───────────┘   └───────────┘
//! ```
//!
//! The runtime-free pieces (splitter, index, registry, prompt, streaming
//! state machine) live in the `docqa-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding models, loaders and the model cache |
//! | [`generation`] | Generation backends |
//! | [`answer`] | Prompt building and answer generation |
//! | [`pipeline`] | Chunk, index, query and answer operations |
//! | [`session`] | Per-document sessions |
//! | [`extract`] | PDF, DOCX and plain text extraction |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod pipeline;
pub mod server;
pub mod session;
