//! # Embeddings
//!
//! This crate provides embedding generation for Chroma collections, fronted
//! by a concurrent, deduplicating cache.
//!
//! ## Features
//!
//! - **Generators**: Turn batches of documents into dense vectors
//! - **Caching**: Each distinct document is embedded at most once
//! - **Coalescing**: Concurrent requests for the same document share one call
//! - **Failure Fan-out**: A failed batch fails every caller waiting on it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     CachedGenerator                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  resolve(keys) ──► cache / waiters ──► dispatch loop            │
//! │       ▲                  │                   │                  │
//! │       │                  ▼                   ▼                  │
//! │   oneshot slots ◄── publish results ◄── Generator               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chroma_embeddings::{CachedGenerator, OpenAIGenerator};
//!
//! let embeddings = CachedGenerator::new(OpenAIGenerator::from_env());
//! let vectors = embeddings.resolve(&documents).await?;
//! ```

pub mod cache;
pub mod config;
mod dispatch;
pub mod error;
pub mod generator;
pub mod openai;

pub use cache::{CacheStats, CachedGenerator};
pub use config::{CacheConfig, OpenAIConfig};
pub use error::{EmbeddingError, Result};
pub use generator::Generator;
pub use openai::OpenAIGenerator;

/// Re-exported so callers can bind a cache to their own lifetime scope.
pub use tokio_util::sync::CancellationToken;

/// A document to embed.
pub type Document = String;

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
