//! Environment-driven configuration
//!
//! All knobs come from the process environment (figment `Env` provider).
//! Loading validates required keys and threshold ranges before the pipeline
//! performs any I/O; a bad environment is a [`IngestError::Config`] and the
//! CLI maps it to exit code 3.

use std::path::PathBuf;

use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;

use crate::error::{IngestError, Result};

/// Which LLM wire protocol to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Ollama-style `/api/generate` on a local endpoint
    Local,
    /// OpenAI-style `/v1/chat/completions`
    Remote,
}

/// Who is responsible for L2-normalizing embedding vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// The encoder normalizes; the engine only verifies
    Local,
    /// The engine normalizes the raw vectors itself
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `owner_name` clones (required)
    pub repos_path: PathBuf,

    // Document store (required)
    pub doc_store_host: String,
    pub doc_store_user: String,
    pub doc_store_password: String,
    pub doc_store_bucket: String,

    // LLM service
    pub llm_provider: LlmProvider,
    pub llm_endpoint: String,
    pub llm_model: String,

    // Embedding service
    pub embedding_endpoint: String,
    pub embedding_mode: EmbeddingMode,
    pub embedding_dim: usize,
    pub embedding_batch: usize,

    // Concurrency bounds
    pub concurrency_files: usize,
    pub parse_workers: usize,

    // Pipeline thresholds
    pub symbol_min_lines: u32,
    pub full_reingest_threshold: f64,
    pub under_chunk_min_bytes: u64,
    pub under_chunk_max_lines_per_symbol: u32,
    pub under_chunk_format_calls: usize,

    /// Token woven into HTTPS clone URLs for private repositories
    pub git_credential: Option<String>,

    /// Defaults to `<REPOS_PATH>/.ingestion.lock`
    pub run_lock_path: Option<PathBuf>,

    // Desired-set sources, consulted in this order before the disk listing
    pub repos_list_api: Option<String>,
    pub repos_list_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repos_path: PathBuf::new(),
            doc_store_host: String::new(),
            doc_store_user: String::new(),
            doc_store_password: String::new(),
            doc_store_bucket: String::new(),
            llm_provider: LlmProvider::Local,
            llm_endpoint: "http://localhost:11434".to_owned(),
            llm_model: "qwen2.5-coder:7b".to_owned(),
            embedding_endpoint: "http://localhost:8080".to_owned(),
            embedding_mode: EmbeddingMode::Local,
            embedding_dim: 768,
            embedding_batch: 128,
            concurrency_files: 10,
            parse_workers: 4,
            symbol_min_lines: 5,
            full_reingest_threshold: 0.05,
            under_chunk_min_bytes: 5_000,
            under_chunk_max_lines_per_symbol: 100,
            under_chunk_format_calls: 5,
            git_credential: None,
            run_lock_path: None,
            repos_list_api: None,
            repos_list_file: None,
        }
    }
}

impl Settings {
    /// Load from the process environment and validate.
    pub fn load() -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Env::raw())
            .extract()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on missing required keys or out-of-range thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.repos_path.as_os_str().is_empty() {
            return Err(IngestError::Config("REPOS_PATH is required".to_owned()));
        }
        for (key, value) in [
            ("DOC_STORE_HOST", &self.doc_store_host),
            ("DOC_STORE_USER", &self.doc_store_user),
            ("DOC_STORE_PASSWORD", &self.doc_store_password),
            ("DOC_STORE_BUCKET", &self.doc_store_bucket),
        ] {
            if value.is_empty() {
                return Err(IngestError::Config(format!("{key} is required")));
            }
        }
        if self.embedding_dim == 0 {
            return Err(IngestError::Config("EMBEDDING_DIM must be positive".to_owned()));
        }
        if self.embedding_batch == 0 {
            return Err(IngestError::Config("EMBEDDING_BATCH must be positive".to_owned()));
        }
        if self.concurrency_files == 0 || self.parse_workers == 0 {
            return Err(IngestError::Config(
                "CONCURRENCY_FILES and PARSE_WORKERS must be positive".to_owned(),
            ));
        }
        if !(self.full_reingest_threshold > 0.0 && self.full_reingest_threshold <= 1.0) {
            return Err(IngestError::Config(format!(
                "FULL_REINGEST_THRESHOLD must be in (0, 1], got {}",
                self.full_reingest_threshold
            )));
        }
        if self.symbol_min_lines == 0 {
            return Err(IngestError::Config("SYMBOL_MIN_LINES must be positive".to_owned()));
        }
        Ok(())
    }

    /// Lock file location, defaulting next to the clones.
    pub fn lock_path(&self) -> PathBuf {
        self.run_lock_path
            .clone()
            .unwrap_or_else(|| self.repos_path.join(".ingestion.lock"))
    }

    /// Directory of a repo's clone on disk.
    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.repos_path.join(crate::types::repo_id_to_folder(repo_id))
    }
}
