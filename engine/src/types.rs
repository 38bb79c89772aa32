//! Core document model for the codeloom index
//!
//! Every persisted entity is a [`Document`]: a flat serde record keyed by a
//! content-addressed identifier and related to other documents by ID only.
//! The four-level hierarchy (symbol → file → module → repo) is expressed
//! through `parent_id`/`children_ids`, never through in-memory pointers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version of the persisted document schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Version of the pipeline that produced a document.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The six persisted document types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    RepoSummary,
    ModuleSummary,
    FileIndex,
    SymbolIndex,
    Document,
    IngestionLog,
}

impl DocType {
    /// Wire name, also the first component of the identity tuple
    pub fn name(&self) -> &'static str {
        match self {
            Self::RepoSummary => "repo_summary",
            Self::ModuleSummary => "module_summary",
            Self::FileIndex => "file_index",
            Self::SymbolIndex => "symbol_index",
            Self::Document => "document",
            Self::IngestionLog => "ingestion_log",
        }
    }

    /// All types that participate in a repo-scoped purge
    pub fn indexed() -> [Self; 5] {
        [
            Self::RepoSummary,
            Self::ModuleSummary,
            Self::FileIndex,
            Self::SymbolIndex,
            Self::Document,
        ]
    }

    /// Audit rows carry no vector; every indexed type must ship a unit-norm
    /// embedding through the single write path.
    pub fn requires_embedding(&self) -> bool {
        !matches!(self, Self::IngestionLog)
    }
}

/// Compute the content-addressed identifier for a document.
///
/// Identity is a pure function of `(type, repo_id, scope, commit)`; equal
/// inputs always collide, and a collision implies content equality.
pub fn document_id(doc_type: DocType, repo_id: &str, scope: &str, commit_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_type.name().as_bytes());
    hasher.update(b":");
    hasher.update(repo_id.as_bytes());
    hasher.update(b":");
    hasher.update(scope.as_bytes());
    hasher.update(b":");
    hasher.update(commit_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Scope string for a symbol-level document: `path#symbol`
pub fn symbol_scope(file_path: &str, symbol_name: &str) -> String {
    format!("{file_path}#{symbol_name}")
}

/// `owner/name` → on-disk folder name
pub fn repo_id_to_folder(repo_id: &str) -> String {
    repo_id.replace('/', "_")
}

/// On-disk folder name → `owner/name` (inverse of [`repo_id_to_folder`])
pub fn folder_to_repo_id(folder: &str) -> String {
    match folder.split_once('_') {
        Some((owner, name)) => format!("{owner}/{name}"),
        None => folder.to_owned(),
    }
}

/// Strongest source that produced a document's summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentLevel {
    None,
    /// Deterministic fallback built from structural metadata
    Basic,
    LlmSummary,
    LlmFull,
}

/// Quality bag carried by every document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quality {
    pub enrichment_level: EnrichmentLevel,
    pub llm_available: bool,
    pub summary_source: String,
    /// Manually curated documents survive incremental runs when set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protect_from_update: bool,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            enrichment_level: EnrichmentLevel::None,
            llm_available: true,
            summary_source: "pipeline".to_owned(),
            protect_from_update: false,
        }
    }
}

/// Version bag carried by every document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub schema_version: u32,
    pub pipeline_version: String,
    /// RFC 3339 creation timestamp
    pub created_at: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            pipeline_version: PIPELINE_VERSION.to_owned(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// One entry in `file_index.metadata.symbols` — every parsed symbol appears,
/// tagged with whether it earned its own `symbol_index` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub name: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub significant: bool,
}

/// Terminal and in-flight states of an ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Counters persisted in the audit record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub repos_processed: u64,
    pub repos_skipped: u64,
    pub repos_updated: u64,
    pub repos_full_reingest: u64,
    pub repos_cloned: u64,
    pub repos_deleted: u64,
    pub repos_error: u64,
    pub files_processed: u64,
    pub files_deleted: u64,
}

/// One recorded failure in `ingestion_log.errors[]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Repo id, file path, or component that failed
    pub scope: String,
    /// Error class, never a stack trace
    pub kind: String,
    pub message: String,
}

/// Type-specific metadata bag. Fields are optional so one record shape
/// serves all six document types against a schema-less store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    // file_index / symbol_index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<SymbolMeta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    // module_summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_files: Option<Vec<String>>,

    // repo_summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<Vec<String>>,

    // document (doc chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    // ingestion_log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<RunCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Pid of the process that wrote the row, for stale-run detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// A persisted index document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Content-addressed identifier; also the store's primary key
    pub document_id: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    /// `owner/name`
    pub repo_id: String,
    /// Per-entity pinned commit: last commit touching the file for
    /// file/symbol documents, repo HEAD for module/repo summaries
    pub commit_hash: String,
    /// The summary text; this is what gets embedded
    pub content: String,
    /// Unit-length vector of the configured dimensionality
    pub embedding: Vec<f32>,
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// POSIX repo-relative directory path, `"."` for the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    /// `function` / `class` / `method`, or `embedded:<kind>` for LLM chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality_score: Option<f64>,
    #[serde(default)]
    pub metadata: DocMetadata,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub version: VersionInfo,
}

impl Document {
    /// Create a document with its identity computed from the addressing tuple.
    /// `scope` is the path, module path, or `path#symbol` for symbols.
    pub fn new(doc_type: DocType, repo_id: &str, scope: &str, commit_hash: &str) -> Self {
        Self {
            document_id: document_id(doc_type, repo_id, scope, commit_hash),
            doc_type,
            repo_id: repo_id.to_owned(),
            commit_hash: commit_hash.to_owned(),
            content: String::new(),
            embedding: Vec::new(),
            parent_id: None,
            children_ids: Vec::new(),
            file_path: None,
            module_path: None,
            symbol_name: None,
            symbol_type: None,
            criticality_score: None,
            metadata: DocMetadata::default(),
            quality: Quality::default(),
            version: VersionInfo::default(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Kind of parsed code symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
}

impl SymbolKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
        }
    }
}

/// A symbol extracted by the parser, in source order. Class methods stay
/// nested under their class; the parser never flattens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-indexed, inclusive
    pub start_line: u32,
    /// 1-indexed, inclusive; always ≥ `start_line`
    pub end_line: u32,
    pub docstring: Option<String>,
    pub methods: Vec<ParsedSymbol>,
}

impl ParsedSymbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, start_line: u32, end_line: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            start_line,
            end_line,
            docstring: None,
            methods: Vec::new(),
        }
    }

    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// Symbols of at least this many lines earn a `symbol_index` document
    pub fn is_significant(&self, min_lines: u32) -> bool {
        self.line_count() >= min_lines
    }
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_deterministic() {
        let a = document_id(DocType::FileIndex, "acme/hello", "src/a.py", "abc123");
        let b = document_id(DocType::FileIndex, "acme/hello", "src/a.py", "abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_document_id_distinguishes_inputs() {
        let base = document_id(DocType::FileIndex, "acme/hello", "src/a.py", "abc123");
        assert_ne!(base, document_id(DocType::SymbolIndex, "acme/hello", "src/a.py", "abc123"));
        assert_ne!(base, document_id(DocType::FileIndex, "acme/other", "src/a.py", "abc123"));
        assert_ne!(base, document_id(DocType::FileIndex, "acme/hello", "src/b.py", "abc123"));
        assert_ne!(base, document_id(DocType::FileIndex, "acme/hello", "src/a.py", "def456"));
    }

    #[test]
    fn test_repo_id_folder_roundtrip() {
        assert_eq!(repo_id_to_folder("acme/hello"), "acme_hello");
        assert_eq!(folder_to_repo_id("acme_hello"), "acme/hello");
        // Underscores in the name survive the inverse transformation
        assert_eq!(folder_to_repo_id("acme_my_repo"), "acme/my_repo");
    }

    #[test]
    fn test_symbol_line_count() {
        let sym = ParsedSymbol::new("hi", SymbolKind::Function, 2, 3);
        assert_eq!(sym.line_count(), 2);
        assert!(!sym.is_significant(5));
        let big = ParsedSymbol::new("run", SymbolKind::Function, 10, 14);
        assert!(big.is_significant(5));
    }

    #[test]
    fn test_document_serde_roundtrip() {
        let doc = Document::new(DocType::FileIndex, "acme/hello", "hello.py", "abc")
            .with_content("A greeter module")
            .with_embedding(vec![1.0, 0.0]);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"file_index\""));
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.document_id, doc.document_id);
        assert_eq!(back.doc_type, DocType::FileIndex);
        assert_eq!(back.embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_embedding_requirement() {
        assert!(DocType::FileIndex.requires_embedding());
        assert!(DocType::Document.requires_embedding());
        assert!(!DocType::IngestionLog.requires_embedding());
    }
}
