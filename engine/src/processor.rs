//! Per-file processor
//!
//! Runs the strictly ordered steps for one file: materialize bytes at the
//! pinned commit, parse, under-chunk check, symbol summaries, file summary,
//! persist. Failure beyond the read aborts the file with a recorded error
//! and never the run. Documentation files route through the heading
//! splitter into `document` chunks instead of the code path.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::chunker::{self, ChunkPrompt, LlmChunk, UnderChunkDetector};
use crate::docsplit;
use crate::embed::{Embedder, TextKind};
use crate::error::{IngestError, Result};
use crate::git::GitRepo;
use crate::llm::{Enricher, SummaryTarget};
use crate::parser::{Language, ParseOutcome, Parser};
use crate::store::DocumentStore;
use crate::types::{
    symbol_scope, DocType, Document, ParsedSymbol, Quality, SymbolKind, SymbolMeta,
};

/// First ~800 characters of a symbol body ride along with its summary into
/// the embedding.
const CODE_PREVIEW_CHARS: usize = 800;
/// The file summary sees at most this many leading lines of the file.
const FILE_PREFIX_LINES: usize = 200;
/// Cap on source shipped to the LLM chunker.
const CHUNKER_SOURCE_LINES: usize = 2_000;

/// What happened to one file
#[derive(Debug, Clone)]
pub enum FileOutcome {
    Processed { document_id: String, symbols: usize },
    /// Current document is flagged `protect_from_update`; left untouched
    Protected,
    SkippedBinary,
}

/// Shared machinery for processing files within one repository.
pub struct FileProcessor {
    pub repo_id: String,
    pub enricher: Arc<Enricher>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn DocumentStore>,
    pub detector: Arc<UnderChunkDetector>,
    /// Bounds the CPU-bound parse work dispatched to blocking threads
    pub parse_sem: Arc<Semaphore>,
    pub symbol_min_lines: u32,
    pub dry_run: bool,
}

impl FileProcessor {
    /// Process one file at its per-file pinned commit.
    pub async fn process(&self, repo: &GitRepo, path: &str) -> Result<FileOutcome> {
        // Step 1: materialize. Missing history or content is a data issue.
        let commit = repo
            .last_commit_for_path(path)
            .await?
            .ok_or_else(|| IngestError::data(path.to_owned(), "no commit touches this path"))?;
        let bytes = repo.show(&commit, path).await?;
        if bytes.contains(&0) {
            log::debug!("{path}: binary content, skipping");
            return Ok(FileOutcome::SkippedBinary);
        }
        let content = String::from_utf8_lossy(&bytes).into_owned();

        if docsplit::is_doc_file(path) {
            return self.process_doc_file(path, &commit, &content).await;
        }
        self.process_code_file(path, &commit, &content).await
    }

    async fn process_code_file(
        &self,
        path: &str,
        commit: &str,
        content: &str,
    ) -> Result<FileOutcome> {
        let language = Language::from_path(path);
        let line_count = content.lines().count() as u32;

        // Step 2: parse on the blocking pool, bounded by the parse semaphore.
        let outcome = self.parse_bounded(path, content, language).await?;
        if outcome.unnamed_skipped > 0 {
            log::warn!("{path}: skipped {} unnameable definitions", outcome.unnamed_skipped);
        }

        // Step 3: under-chunk check, optionally asking the LLM for chunks.
        let symbol_total = chunker::total_symbol_count(&outcome.symbols);
        let mut embedded_chunks: Vec<LlmChunk> = Vec::new();
        if let Some(reason) = self.detector.evaluate(path, content, symbol_total) {
            log::debug!("{path}: under-chunk flag {reason:?}");
            let excerpt = first_lines(content, CHUNKER_SOURCE_LINES);
            let proposals = self
                .enricher
                .propose_chunks(ChunkPrompt::for_reason(reason), path, &excerpt)
                .await;
            embedded_chunks = chunker::filter_and_merge(&outcome.symbols, proposals, line_count);
        }

        // Honor manual curation before doing any write work.
        let previous = self.store.find_one(DocType::FileIndex, &self.repo_id, Some(path)).await?;
        if previous.as_ref().is_some_and(|doc| doc.quality.protect_from_update) {
            log::info!("{path}: protected from update, keeping existing document");
            return Ok(FileOutcome::Protected);
        }

        let file_doc_id =
            crate::types::document_id(DocType::FileIndex, &self.repo_id, path, commit);

        // Step 4: symbol summaries for significant symbols and accepted
        // embedded chunks.
        let mut symbol_docs: Vec<Document> = Vec::new();
        let flat = flatten_symbols(&outcome.symbols);
        for entry in &flat {
            if !entry.symbol.is_significant(self.symbol_min_lines) {
                continue;
            }
            let doc = self
                .build_symbol_doc(path, commit, content, entry, &file_doc_id, language)
                .await?;
            symbol_docs.push(doc);
        }
        for chunk in &embedded_chunks {
            let doc = self
                .build_embedded_doc(path, commit, content, chunk, &file_doc_id, language)
                .await?;
            symbol_docs.push(doc);
        }

        // Step 5: file summary over the symbol summaries plus the prefix.
        let prefix = first_lines(content, FILE_PREFIX_LINES);
        let symbol_summaries: Vec<String> =
            symbol_docs.iter().map(|d| d.content.clone()).collect();
        let module_docstring = first_module_docstring(content, language);
        let target = SummaryTarget::File {
            path: path.to_owned(),
            language: language.map(|l| l.name().to_owned()),
            symbol_names: flat.iter().map(|e| e.qualified.clone()).collect(),
            module_docstring,
            symbol_summaries,
            prefix: prefix.clone(),
        };
        let summary = self.enricher.summarize(&target).await;

        let embedding = self
            .embedder
            .embed_one(&format!("{}\n{}", summary.text, prefix), TextKind::Document)
            .await?;

        let mut file_doc = Document::new(DocType::FileIndex, &self.repo_id, path, commit)
            .with_content(summary.text)
            .with_embedding(embedding);
        file_doc.file_path = Some(path.to_owned());
        file_doc.children_ids = symbol_docs.iter().map(|d| d.document_id.clone()).collect();
        file_doc.metadata.language = language.map(|l| l.name().to_owned());
        file_doc.metadata.line_count = Some(line_count);
        file_doc.metadata.imports = Some(outcome.imports.clone());
        file_doc.metadata.symbols = Some(symbol_metadata(&flat, self.symbol_min_lines));
        file_doc.quality = Quality {
            enrichment_level: summary.level,
            llm_available: summary.llm_available,
            summary_source: "pipeline".to_owned(),
            protect_from_update: false,
        };

        // Step 6: persist symbols first, then the file document. A changed
        // file id orphans the previous generation of symbols; purge them
        // before the new set lands.
        let symbol_count = symbol_docs.len();
        if !self.dry_run {
            if previous.as_ref().is_some_and(|old| old.document_id != file_doc.document_id) {
                self.store
                    .delete_by_query(&self.repo_id, DocType::SymbolIndex, Some(path))
                    .await?;
                self.store.delete_by_query(&self.repo_id, DocType::FileIndex, Some(path)).await?;
            }
            self.store.upsert_bulk(&symbol_docs).await?;
            self.store.upsert(&file_doc).await?;
        }

        Ok(FileOutcome::Processed { document_id: file_doc.document_id, symbols: symbol_count })
    }

    /// Documentation files become `document` chunks, one per section.
    async fn process_doc_file(
        &self,
        path: &str,
        commit: &str,
        content: &str,
    ) -> Result<FileOutcome> {
        let sections = docsplit::split(path, content);

        let mut docs: Vec<Document> = Vec::new();
        for section in &sections {
            let scope = format!("{path}#{}", section.heading);
            let text = trim_to_chars(&section.body, 4_000);
            let embed_input =
                if text.trim().is_empty() { section.heading.clone() } else { text.clone() };
            let embedding = self.embedder.embed_one(&embed_input, TextKind::Document).await?;

            let mut doc = Document::new(DocType::Document, &self.repo_id, &scope, commit)
                .with_content(text)
                .with_embedding(embedding);
            doc.file_path = Some(path.to_owned());
            doc.metadata.section = Some(section.heading.clone());
            doc.metadata.start_line = Some(section.start_line);
            doc.metadata.end_line = Some(section.end_line);
            docs.push(doc);
        }

        if !self.dry_run {
            let stale = self
                .store
                .find_one(DocType::Document, &self.repo_id, Some(path))
                .await?
                .is_some_and(|old| old.commit_hash != commit);
            if stale {
                self.store.delete_by_query(&self.repo_id, DocType::Document, Some(path)).await?;
            }
            self.store.upsert_bulk(&docs).await?;
        }

        // The first section's id stands in for the file in progress output.
        let document_id =
            docs.first().map(|d| d.document_id.clone()).unwrap_or_default();
        Ok(FileOutcome::Processed { document_id, symbols: docs.len() })
    }

    async fn parse_bounded(
        &self,
        path: &str,
        content: &str,
        language: Option<Language>,
    ) -> Result<ParseOutcome> {
        let Some(language) = language else {
            // No grammar: empty symbol list, file still gets indexed.
            return Ok(ParseOutcome::default());
        };

        let _permit = self
            .parse_sem
            .acquire()
            .await
            .map_err(|_| IngestError::operation(path.to_owned(), "parse pool closed"))?;

        let source = content.to_owned();
        let path_owned = path.to_owned();
        tokio::task::spawn_blocking(move || {
            Parser::new()
                .parse(&source, language)
                .map_err(|e| IngestError::operation(path_owned, e))
        })
        .await
        .map_err(|e| IngestError::operation(path.to_owned(), format!("parse task: {e}")))?
    }

    async fn build_symbol_doc(
        &self,
        path: &str,
        commit: &str,
        content: &str,
        entry: &FlatSymbol,
        file_doc_id: &str,
        language: Option<Language>,
    ) -> Result<Document> {
        let code = slice_lines(content, entry.symbol.start_line, entry.symbol.end_line);
        let target = SummaryTarget::Symbol {
            name: entry.qualified.clone(),
            kind: entry.symbol.kind.name().to_owned(),
            docstring: entry.symbol.docstring.clone(),
            code: code.clone(),
        };
        let summary = self.enricher.summarize(&target).await;

        let preview = trim_to_chars(&code, CODE_PREVIEW_CHARS);
        let embedding = self
            .embedder
            .embed_one(&format!("{}\n{preview}", summary.text), TextKind::Document)
            .await?;

        let scope = symbol_scope(path, &entry.qualified);
        let mut doc = Document::new(DocType::SymbolIndex, &self.repo_id, &scope, commit)
            .with_content(summary.text)
            .with_embedding(embedding)
            .with_parent(file_doc_id);
        doc.file_path = Some(path.to_owned());
        doc.symbol_name = Some(entry.symbol.name.clone());
        doc.symbol_type = Some(entry.symbol.kind.name().to_owned());
        doc.metadata.language = language.map(|l| l.name().to_owned());
        doc.metadata.start_line = Some(entry.symbol.start_line);
        doc.metadata.end_line = Some(entry.symbol.end_line);
        doc.metadata.docstring = entry.symbol.docstring.clone();
        if entry.symbol.kind == SymbolKind::Class {
            doc.metadata.methods =
                Some(entry.symbol.methods.iter().map(|m| m.name.clone()).collect());
        }
        doc.quality = Quality {
            enrichment_level: summary.level,
            llm_available: summary.llm_available,
            summary_source: "pipeline".to_owned(),
            protect_from_update: false,
        };
        Ok(doc)
    }

    async fn build_embedded_doc(
        &self,
        path: &str,
        commit: &str,
        content: &str,
        chunk: &LlmChunk,
        file_doc_id: &str,
        language: Option<Language>,
    ) -> Result<Document> {
        let code = slice_lines(content, chunk.start_line, chunk.end_line);
        let symbol_type = format!("embedded:{}", chunk.kind);
        let target = SummaryTarget::Symbol {
            name: chunk.name.clone(),
            kind: symbol_type.clone(),
            docstring: None,
            code: code.clone(),
        };
        let summary = self.enricher.summarize(&target).await;

        let preview = trim_to_chars(&code, CODE_PREVIEW_CHARS);
        let embedding = self
            .embedder
            .embed_one(&format!("{}\n{preview}", summary.text), TextKind::Document)
            .await?;

        let scope = symbol_scope(path, &chunk.name);
        let mut doc = Document::new(DocType::SymbolIndex, &self.repo_id, &scope, commit)
            .with_content(summary.text)
            .with_embedding(embedding)
            .with_parent(file_doc_id);
        doc.file_path = Some(path.to_owned());
        doc.symbol_name = Some(chunk.name.clone());
        doc.symbol_type = Some(symbol_type);
        doc.metadata.language = language.map(|l| l.name().to_owned());
        doc.metadata.start_line = Some(chunk.start_line);
        doc.metadata.end_line = Some(chunk.end_line);
        doc.metadata.tags = Some(chunk.tags.clone());
        doc.quality = Quality {
            enrichment_level: summary.level,
            llm_available: summary.llm_available,
            summary_source: "llm_chunker".to_owned(),
            protect_from_update: false,
        };
        Ok(doc)
    }
}

/// A symbol with its class-qualified name, flattened for iteration while
/// the nested structure stays in `file_index.metadata`.
struct FlatSymbol {
    qualified: String,
    symbol: ParsedSymbol,
}

fn flatten_symbols(symbols: &[ParsedSymbol]) -> Vec<FlatSymbol> {
    fn push(prefix: Option<&str>, symbols: &[ParsedSymbol], out: &mut Vec<FlatSymbol>) {
        for sym in symbols {
            let qualified = match prefix {
                Some(parent) => format!("{parent}.{}", sym.name),
                None => sym.name.clone(),
            };
            out.push(FlatSymbol { qualified: qualified.clone(), symbol: sym.clone() });
            push(Some(&qualified), &sym.methods, out);
        }
    }
    let mut out = Vec::new();
    push(None, symbols, &mut out);
    out
}

fn symbol_metadata(flat: &[FlatSymbol], min_lines: u32) -> Vec<SymbolMeta> {
    flat.iter()
        .map(|entry| SymbolMeta {
            name: entry.qualified.clone(),
            kind: entry.symbol.kind.name().to_owned(),
            start_line: entry.symbol.start_line,
            end_line: entry.symbol.end_line,
            significant: entry.symbol.is_significant(min_lines),
        })
        .collect()
}

/// 1-indexed inclusive line slice.
fn slice_lines(content: &str, start: u32, end: u32) -> String {
    content
        .lines()
        .skip(start.saturating_sub(1) as usize)
        .take((end.saturating_sub(start) + 1) as usize)
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_lines(content: &str, n: usize) -> String {
    content.lines().take(n).collect::<Vec<_>>().join("\n")
}

fn trim_to_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_owned()
}

/// Module-level docstring for the fallback summary (Python-style leading
/// string, or nothing).
fn first_module_docstring(content: &str, language: Option<Language>) -> Option<String> {
    if language != Some(Language::Python) {
        return None;
    }
    let trimmed = content.trim_start();
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = trimmed.strip_prefix(quote) {
            let end = rest.find(quote)?;
            let doc = rest[..end].trim().to_owned();
            return (!doc.is_empty()).then_some(doc);
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;
    use crate::chunker::UnderChunkThresholds;
    use crate::embed::normalize;
    use crate::error::Result as EngineResult;
    use crate::llm::{LlmClient, LlmReply};
    use crate::store::MemoryDocumentStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const DIM: usize = 8;

    /// Always replies with valid JSON echoing the prompt's first line.
    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, prompt: &str) -> EngineResult<LlmReply> {
            let first = prompt.lines().next().unwrap_or("").replace('"', "'");
            Ok(LlmReply { text: format!(r#"{{"summary": "{first}"}}"#), tokens: 2 })
        }
    }

    /// Deterministic unit vectors keyed off the text bytes.
    struct HashingEmbedder;

    #[async_trait]
    impl Embedder for HashingEmbedder {
        fn dim(&self) -> usize {
            DIM
        }

        async fn embed(&self, texts: &[String], _kind: TextKind) -> EngineResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.5f32; DIM];
                    v[t.len() % DIM] = 2.0;
                    normalize(&mut v);
                    v
                })
                .collect())
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git").current_dir(dir).args(args).output().unwrap();
        assert!(out.status.success(), "git {:?} failed", args);
    }

    fn init_repo(files: &[(&str, &str)]) -> TempDir {
        let temp = TempDir::new().unwrap();
        git(temp.path(), &["init"]);
        git(temp.path(), &["config", "user.email", "test@test.com"]);
        git(temp.path(), &["config", "user.name", "Test"]);
        for (path, content) in files {
            let full = temp.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        git(temp.path(), &["add", "."]);
        git(temp.path(), &["commit", "-m", "initial"]);
        temp
    }

    fn processor(store: Arc<MemoryDocumentStore>) -> FileProcessor {
        FileProcessor {
            repo_id: "acme/hello".to_string(),
            enricher: Arc::new(Enricher::new(Box::new(EchoLlm))),
            embedder: Arc::new(HashingEmbedder),
            store,
            detector: Arc::new(UnderChunkDetector::new(UnderChunkThresholds::default())),
            parse_sem: Arc::new(Semaphore::new(4)),
            symbol_min_lines: 5,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_small_function_gets_no_symbol_document() {
        let temp = init_repo(&[("hello.py", "\"\"\"Greeter.\"\"\"\ndef hi(name):\n    return f\"Hi {name}\"\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        let outcome = proc.process(&repo, "hello.py").await.unwrap();
        let FileOutcome::Processed { symbols, .. } = outcome else { panic!("expected processed") };
        assert_eq!(symbols, 0);

        assert_eq!(store.count_by(DocType::SymbolIndex, None).await.unwrap(), 0);
        let file_doc = store
            .find_one(DocType::FileIndex, "acme/hello", Some("hello.py"))
            .await
            .unwrap()
            .unwrap();
        let metas = file_doc.metadata.symbols.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].name, "hi");
        assert_eq!((metas[0].start_line, metas[0].end_line), (2, 3));
        assert!(!metas[0].significant);
        assert_eq!(file_doc.metadata.line_count, Some(3));
    }

    #[tokio::test]
    async fn test_significant_symbol_links_to_file() {
        let body: String =
            (0..6).map(|i| format!("    x{i} = {i}\n")).collect();
        let source = format!("def work(data):\n{body}    return data\n");
        let temp = init_repo(&[("job.py", source.as_str())]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "job.py").await.unwrap();

        let file_doc =
            store.find_one(DocType::FileIndex, "acme/hello", Some("job.py")).await.unwrap().unwrap();
        let sym_doc = store
            .find_one(DocType::SymbolIndex, "acme/hello", Some("job.py"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sym_doc.parent_id.as_deref(), Some(file_doc.document_id.as_str()));
        assert!(file_doc.children_ids.contains(&sym_doc.document_id));
        assert_eq!(sym_doc.symbol_name.as_deref(), Some("work"));

        // Range sanity against the parent's line count.
        let (start, end) =
            (sym_doc.metadata.start_line.unwrap(), sym_doc.metadata.end_line.unwrap());
        assert!(1 <= start && start <= end);
        assert!(end <= file_doc.metadata.line_count.unwrap());
    }

    #[tokio::test]
    async fn test_reprocessing_changed_file_purges_old_symbols() {
        let big_fn = |tag: &str| {
            format!("def work(data):\n{}    return '{tag}'\n", "    step()\n".repeat(6))
        };
        let v1 = big_fn("one");
        let temp = init_repo(&[("job.py", v1.as_str())]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "job.py").await.unwrap();
        let old_file =
            store.find_one(DocType::FileIndex, "acme/hello", Some("job.py")).await.unwrap().unwrap();

        std::fs::write(temp.path().join("job.py"), big_fn("two")).unwrap();
        git(temp.path(), &["add", "."]);
        git(temp.path(), &["commit", "-m", "change job"]);

        proc.process(&repo, "job.py").await.unwrap();

        // One file document and one symbol generation; the old ones are gone.
        assert_eq!(store.count_by(DocType::FileIndex, Some("acme/hello")).await.unwrap(), 1);
        assert_eq!(store.count_by(DocType::SymbolIndex, Some("acme/hello")).await.unwrap(), 1);
        let new_file =
            store.find_one(DocType::FileIndex, "acme/hello", Some("job.py")).await.unwrap().unwrap();
        assert_ne!(new_file.document_id, old_file.document_id);
    }

    #[tokio::test]
    async fn test_same_commit_reprocess_is_idempotent() {
        let temp = init_repo(&[("hello.py", "def hi():\n    return 1\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "hello.py").await.unwrap();
        let first: Vec<String> = store
            .list_by_type(DocType::FileIndex)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.document_id)
            .collect();

        proc.process(&repo, "hello.py").await.unwrap();
        let second: Vec<String> = store
            .list_by_type(DocType::FileIndex)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.document_id)
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_protected_document_is_not_rewritten() {
        let temp = init_repo(&[("hello.py", "def hi():\n    return 1\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "hello.py").await.unwrap();
        let mut doc =
            store.find_one(DocType::FileIndex, "acme/hello", Some("hello.py")).await.unwrap().unwrap();
        doc.quality.protect_from_update = true;
        doc.content = "manually curated".to_string();
        store.upsert(&doc).await.unwrap();

        let outcome = proc.process(&repo, "hello.py").await.unwrap();
        assert!(matches!(outcome, FileOutcome::Protected));

        let kept =
            store.find_one(DocType::FileIndex, "acme/hello", Some("hello.py")).await.unwrap().unwrap();
        assert_eq!(kept.content, "manually curated");
    }

    #[tokio::test]
    async fn test_unknown_language_still_emits_file_index() {
        let temp = init_repo(&[("config.yaml", "name: demo\nreplicas: 2\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "config.yaml").await.unwrap();
        let doc = store
            .find_one(DocType::FileIndex, "acme/hello", Some("config.yaml"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.metadata.symbols.unwrap().len(), 0);
        assert!(doc.metadata.language.is_none());
    }

    #[tokio::test]
    async fn test_markdown_becomes_document_chunks() {
        let temp = init_repo(&[("README.md", "# Title\n\nIntro.\n\n## Install\n\nSteps.\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let proc = processor(store.clone());

        proc.process(&repo, "README.md").await.unwrap();

        let chunks = store.list_by_type(DocType::Document).await.unwrap();
        assert_eq!(chunks.len(), 2);
        let sections: Vec<&str> =
            chunks.iter().filter_map(|d| d.metadata.section.as_deref()).collect();
        assert!(sections.contains(&"Title"));
        assert!(sections.contains(&"Install"));
        assert_eq!(store.count_by(DocType::FileIndex, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let temp = init_repo(&[("hello.py", "def hi():\n    return 1\n")]);
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        let mut proc = processor(store.clone());
        proc.dry_run = true;

        let outcome = proc.process(&repo, "hello.py").await.unwrap();
        assert!(matches!(outcome, FileOutcome::Processed { .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_slice_lines_inclusive() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(slice_lines(text, 2, 3), "b\nc");
        assert_eq!(slice_lines(text, 1, 1), "a");
    }

    #[test]
    fn test_flatten_qualifies_methods() {
        let mut class = ParsedSymbol::new("Greeter", SymbolKind::Class, 1, 10);
        class.methods.push(ParsedSymbol::new("greet", SymbolKind::Method, 3, 9));
        let flat = flatten_symbols(&[class]);
        let names: Vec<&str> = flat.iter().map(|f| f.qualified.as_str()).collect();
        assert_eq!(names, vec!["Greeter", "Greeter.greet"]);
    }
}
