//! Codeloom Engine - Incremental hierarchical code indexing for RAG
//!
//! This crate turns a set of Git repositories into a four-level document
//! hierarchy (symbol → file → module → repository) persisted to an external
//! document store, including:
//!
//! - Reconciliation of desired repos vs. on-disk clones vs. the index
//! - Per-repo change detection (skip / surgical update / full re-ingest)
//! - Tree-sitter symbol extraction across six languages
//! - Under-chunk detection with an optional LLM chunking pass
//! - LLM summaries with a circuit breaker and deterministic fallbacks
//! - Unit-normalized embeddings behind a single write path
//! - Content-addressed document identity and idempotent upserts
//! - A PageRank criticality sidecar over the import graph
//!
//! # Example
//!
//! ```rust,ignore
//! use codeloom_engine::{Pipeline, PipelineOptions, IngestTarget, Settings};
//!
//! let settings = Settings::load()?;
//! let pipeline = Pipeline::new(settings, store, enricher, embedder, cancel)?;
//! let outcome = pipeline
//!     .run(&PipelineOptions { target: IngestTarget::All, dry_run: false, skip_existing: false })
//!     .await?;
//! println!("{}", outcome.status.name());
//! ```

// Core pipeline modules
pub mod aggregate;
pub mod audit;
pub mod change;
pub mod chunker;
pub mod config;
pub mod criticality;
pub mod docsplit;
pub mod embed;
pub mod error;
pub mod git;
pub mod llm;
pub mod lock;
pub mod parser;
pub mod pipeline;
pub mod processor;
pub mod reconcile;
pub mod store;
pub mod types;

// Re-exports of the surface the CLI drives
pub use audit::{AuditLog, Counters};
pub use config::{EmbeddingMode, LlmProvider, Settings};
pub use embed::{Embedder, HttpEmbedder, TextKind};
pub use error::{IngestError, Result};
pub use git::GitRepo;
pub use llm::{Enricher, HttpLlm, LlmClient};
pub use lock::{holder, RunLock};
pub use pipeline::{IngestTarget, Pipeline, PipelineOptions, RunOutcome};
pub use store::{
    normalize_embeddings, DocumentStore, HttpDocumentStore, MemoryDocumentStore,
};
pub use types::{DocType, Document, EnrichmentLevel, RunCounters, RunStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.chars().any(|c| c.is_ascii_digit()));
    }
}
