//! # ensemble - multi-backend LLM client
//!
//! A provider-agnostic client library for LLM backends: one stable surface
//! for text generation, multi-turn conversation, schema-constrained
//! structured output and token-level streaming, fanned out across multiple
//! heterogeneous backends with a single result selected per call.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - One [`Backend`] trait implemented by every concrete adapter and by the
//!   [`Dispatcher`] itself, so a multi-backend setup is a drop-in for a
//!   single backend
//! - Fastest / Primary / Consensus selection strategies
//! - Majority, similarity-grouped and weighted consensus over outcomes
//! - Streaming via Server-Sent Events with pooled tokens and channels
//! - Per-adapter message-conversion caching on the hot path
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use ensemble::consensus::{ConsensusConfig, ConsensusStrategy};
//! use ensemble::dispatcher::{Dispatcher, Strategy};
//! use ensemble::providers::{GeminiBackend, OpenAiBackend};
//! use ensemble::Backend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .backend(Arc::new(OpenAiBackend::new("sk-...", "gpt-4o")))
//!         .weighted_backend(Arc::new(GeminiBackend::new("key", "gemini-2.0-flash")), 0.8)
//!         .strategy(Strategy::Consensus)
//!         .consensus(ConsensusConfig {
//!             strategy: ConsensusStrategy::Similarity,
//!             similarity_threshold: 0.6,
//!         })
//!         .build()?;
//!
//!     let answer = dispatcher.generate("What is the capital of France?", &[]).await?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod consensus;
pub mod dispatcher;
pub mod error;
mod hash;
pub mod http;
pub mod model;
pub mod options;
pub mod pool;
pub mod providers;
pub mod schema;
pub mod similarity;
pub mod sse;

// Re-exports for convenience
pub use backend::{Backend, TokenStream};
pub use consensus::{ConsensusConfig, ConsensusStrategy};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Strategy};
pub use error::{Error, ErrorKind, ProviderError, Result};
pub use model::{ContentKind, ContentPart, Message, Response, Role, Source, Token};
pub use options::{CallOption, ProviderOptions, SecretString, TransportOptions};
