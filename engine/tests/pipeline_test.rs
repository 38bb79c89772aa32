//! End-to-end pipeline tests
//!
//! Drive the full orchestrator against real temporary Git repositories, an
//! in-memory document store and deterministic LLM/embedding doubles, and
//! check the pipeline's observable guarantees: idempotent identities,
//! unit-norm embeddings, bidirectional links, no-op incrementality,
//! surgical updates, renames and repo-scoped purges.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use codeloom_engine::embed::TextKind;
use codeloom_engine::llm::{LlmClient, LlmReply};
use codeloom_engine::{
    DocType, DocumentStore, Embedder, Enricher, IngestTarget, MemoryDocumentStore, Pipeline,
    PipelineOptions, Result, RunStatus, Settings,
};

const DIM: usize = 16;

struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn complete(&self, prompt: &str) -> Result<LlmReply> {
        let first = prompt.lines().next().unwrap_or("").replace('"', "'");
        Ok(LlmReply { text: format!(r#"{{"summary": "{first}"}}"#), tokens: 3 })
    }
}

/// Fails every call; stands in for a dead LLM endpoint.
struct DownLlm;

#[async_trait]
impl LlmClient for DownLlm {
    async fn complete(&self, _prompt: &str) -> Result<LlmReply> {
        Err(codeloom_engine::IngestError::transient("llm", "503 Service Unavailable"))
    }
}

struct HashingEmbedder;

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        DIM
    }

    async fn embed(&self, texts: &[String], _kind: TextKind) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.1f32; DIM];
                v[t.len() % DIM] = 1.0;
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                v.iter_mut().for_each(|x| *x /= norm);
                v
            })
            .collect())
    }
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git").current_dir(dir).args(args).output().unwrap();
    assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
}

/// Create a clone at `repos_path/owner_name` with the given files.
fn seed_repo(repos_path: &Path, repo_id: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = repos_path.join(repo_id.replace('/', "_"));
    std::fs::create_dir_all(&dir).unwrap();
    git(&dir, &["init"]);
    git(&dir, &["config", "user.email", "test@test.com"]);
    git(&dir, &["config", "user.name", "Test"]);
    write_files(&dir, files);
    git(&dir, &["add", "-A"]);
    git(&dir, &["commit", "-m", "initial"]);
    dir
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
}

fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

struct Harness {
    _repos: TempDir,
    settings: Settings,
    store: Arc<MemoryDocumentStore>,
}

impl Harness {
    fn new() -> Self {
        let repos = TempDir::new().unwrap();
        let settings = Settings {
            repos_path: repos.path().to_path_buf(),
            doc_store_host: "http://unused".to_owned(),
            doc_store_user: "test".to_owned(),
            doc_store_password: "test".to_owned(),
            doc_store_bucket: "test".to_owned(),
            embedding_dim: DIM,
            ..Settings::default()
        };
        let store = Arc::new(MemoryDocumentStore::new(DIM));
        Self { _repos: repos, settings, store }
    }

    fn repos_path(&self) -> &Path {
        &self.settings.repos_path
    }

    fn pipeline_with(&self, llm: Box<dyn LlmClient>) -> Pipeline {
        Pipeline::new(
            self.settings.clone(),
            self.store.clone(),
            Arc::new(Enricher::new(llm)),
            Arc::new(HashingEmbedder),
            CancellationToken::new(),
        )
        .unwrap()
    }

    async fn ingest_all(&self) -> codeloom_engine::RunOutcome {
        self.pipeline_with(Box::new(EchoLlm))
            .run(&PipelineOptions {
                target: IngestTarget::All,
                dry_run: false,
                skip_existing: false,
            })
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// S1: cold ingest of a tiny repo
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cold_ingest_tiny_repo() {
    let harness = Harness::new();
    seed_repo(
        harness.repos_path(),
        "acme/hello",
        &[("hello.py", "\"\"\"Greeter.\"\"\"\ndef hi(name):\n    return f\"Hi {name}\"\n")],
    );

    let outcome = harness.ingest_all().await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.repos_processed, 1);
    assert_eq!(outcome.counters.files_processed, 1);

    let store = harness.store.as_ref();
    assert_eq!(store.count_by(DocType::RepoSummary, Some("acme/hello")).await.unwrap(), 1);
    assert_eq!(store.count_by(DocType::ModuleSummary, Some("acme/hello")).await.unwrap(), 1);
    assert_eq!(store.count_by(DocType::FileIndex, Some("acme/hello")).await.unwrap(), 1);
    assert_eq!(store.count_by(DocType::SymbolIndex, Some("acme/hello")).await.unwrap(), 0);

    let repo = store.find_one(DocType::RepoSummary, "acme/hello", None).await.unwrap().unwrap();
    assert_eq!(repo.metadata.modules.as_deref(), Some(&[".".to_owned()][..]));

    let file =
        store.find_one(DocType::FileIndex, "acme/hello", Some("hello.py")).await.unwrap().unwrap();
    let symbols = file.metadata.symbols.as_deref().unwrap();
    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0].name, "hi");
    assert_eq!(symbols[0].kind, "function");
    assert_eq!((symbols[0].start_line, symbols[0].end_line), (2, 3));
    assert!(!symbols[0].significant);
}

// ---------------------------------------------------------------------------
// Universal invariants: embeddings, links, ranges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_documents_satisfy_link_and_embedding_invariants() {
    let harness = Harness::new();
    let body: String = (0..8).map(|i| format!("    v{i} = {i}\n")).collect();
    seed_repo(
        harness.repos_path(),
        "acme/app",
        &[
            ("src/api.py", &format!("\"\"\"API.\"\"\"\ndef handle(req):\n{body}    return req\n")),
            ("src/db.py", "def ping():\n    return True\n"),
            ("README.md", "# App\n\nA sample service.\n"),
        ],
    );

    harness.ingest_all().await;
    let store = harness.store.as_ref();

    for doc_type in DocType::indexed() {
        for doc in store.list_by_type(doc_type).await.unwrap() {
            // Normalization and dimensionality, at rest.
            assert_eq!(doc.embedding.len(), DIM, "{}", doc.document_id);
            let norm: f32 = doc.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() <= 1.0e-3, "norm {norm} for {}", doc.document_id);

            // Every parent resolves and lists this child.
            if let Some(parent_id) = &doc.parent_id {
                let parent = store.get(parent_id).await.unwrap().unwrap_or_else(|| {
                    panic!("dangling parent {parent_id} for {}", doc.document_id)
                });
                assert!(
                    parent.children_ids.contains(&doc.document_id),
                    "parent {} does not list {}",
                    parent.document_id,
                    doc.document_id
                );
            }
        }
    }

    // Symbol ranges live inside their file's line count.
    for sym in store.list_by_type(DocType::SymbolIndex).await.unwrap() {
        let parent = store.get(sym.parent_id.as_deref().unwrap()).await.unwrap().unwrap();
        let (start, end) = (sym.metadata.start_line.unwrap(), sym.metadata.end_line.unwrap());
        assert!(1 <= start && start <= end);
        assert!(end <= parent.metadata.line_count.unwrap());
    }
}

// ---------------------------------------------------------------------------
// S2: rerun with no changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchanged_rerun_is_a_noop() {
    let harness = Harness::new();
    seed_repo(harness.repos_path(), "acme/hello", &[("hello.py", "def hi():\n    return 1\n")]);

    harness.ingest_all().await;
    let ids_before: Vec<String> = harness
        .store
        .list_by_type(DocType::FileIndex)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.document_id)
        .collect();
    let writes_before = harness.store.write_count();

    let outcome = harness.ingest_all().await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.repos_processed, 1);
    assert_eq!(outcome.counters.repos_skipped, 1);
    assert_eq!(outcome.counters.files_processed, 0);
    assert!(outcome.errors.is_empty());

    // No LLM work, and the only store writes are the audit row's
    // start/finalize pair; no index document moved.
    assert_eq!(outcome.llm_tokens, 0);
    assert_eq!(harness.store.write_count(), writes_before + 2);

    let ids_after: Vec<String> = harness
        .store
        .list_by_type(DocType::FileIndex)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.document_id)
        .collect();
    assert_eq!(ids_before, ids_after);
}

// ---------------------------------------------------------------------------
// S3: modify one file out of many
// ---------------------------------------------------------------------------

#[tokio::test]
async fn surgical_update_touches_only_the_changed_file() {
    let harness = Harness::new();
    // Enough files that a single edit stays under the 5% re-ingest ratio.
    let files: Vec<(String, String)> = (0..30)
        .map(|i| (format!("src/f{i}.py"), format!("def f{i}():\n    return {i}\n")))
        .collect();
    let file_refs: Vec<(&str, &str)> =
        files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    let dir = seed_repo(harness.repos_path(), "acme/many", &file_refs);

    harness.ingest_all().await;
    let before: std::collections::HashMap<String, String> = harness
        .store
        .list_by_type(DocType::FileIndex)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.file_path.clone().unwrap(), d.document_id))
        .collect();

    write_files(&dir, &[("src/f3.py", "def f3():\n    return 333\n")]);
    commit_all(&dir, "edit f3");

    let outcome = harness.ingest_all().await;
    assert_eq!(outcome.counters.repos_updated, 1);
    assert_eq!(outcome.counters.files_processed, 1);

    let after: std::collections::HashMap<String, String> = harness
        .store
        .list_by_type(DocType::FileIndex)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.file_path.clone().unwrap(), d.document_id))
        .collect();

    assert_ne!(before["src/f3.py"], after["src/f3.py"]);
    for (path, id) in &before {
        if path != "src/f3.py" {
            assert_eq!(id, &after[path], "{path} should not have churned");
        }
    }

    // The changed file's module chain regenerated at the new HEAD.
    let head = {
        let out = Command::new("git")
            .current_dir(&dir)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_owned()
    };
    let src_module = harness
        .store
        .find_one(DocType::ModuleSummary, "acme/many", Some("src"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(src_module.commit_hash, head);
    let repo_summary =
        harness.store.find_one(DocType::RepoSummary, "acme/many", None).await.unwrap().unwrap();
    assert_eq!(repo_summary.commit_hash, head);
}

// ---------------------------------------------------------------------------
// Rename handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rename_moves_the_file_index() {
    let harness = Harness::new();
    // Enough sibling files that one rename stays under the re-ingest ratio.
    let mut files: Vec<(String, String)> = (0..30)
        .map(|i| (format!("src/m{i}.py"), format!("def m{i}():\n    return {i}\n")))
        .collect();
    files.push(("src/old_name.py".to_owned(), "def act():\n    return 'x'\n".to_owned()));
    let file_refs: Vec<(&str, &str)> =
        files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    let dir = seed_repo(harness.repos_path(), "acme/mv", &file_refs);

    harness.ingest_all().await;

    git(&dir, &["mv", "src/old_name.py", "src/new_name.py"]);
    commit_all(&dir, "rename");

    harness.ingest_all().await;
    let store = harness.store.as_ref();

    assert!(store
        .find_one(DocType::FileIndex, "acme/mv", Some("src/old_name.py"))
        .await
        .unwrap()
        .is_none());
    let renamed = store
        .find_one(DocType::FileIndex, "acme/mv", Some("src/new_name.py"))
        .await
        .unwrap()
        .unwrap();

    let module =
        store.find_one(DocType::ModuleSummary, "acme/mv", Some("src")).await.unwrap().unwrap();
    assert!(module.children_ids.contains(&renamed.document_id));
    let old_ids: Vec<_> = store
        .list_by_type(DocType::FileIndex)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.file_path.as_deref() == Some("src/old_name.py"))
        .collect();
    assert!(old_ids.is_empty());
}

// ---------------------------------------------------------------------------
// Repo-scoped purge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removing_a_repo_purges_every_document_type() {
    let harness = Harness::new();
    let body: String = (0..8).map(|i| format!("    s{i} = {i}\n")).collect();
    let dir = seed_repo(
        harness.repos_path(),
        "acme/doomed",
        &[
            ("src/core.py", &format!("def run():\n{body}    return 1\n")),
            ("README.md", "# Doomed\n\nSoon gone.\n"),
        ],
    );
    seed_repo(harness.repos_path(), "acme/kept", &[("keep.py", "def keep():\n    return 1\n")]);

    harness.ingest_all().await;
    let store = harness.store.as_ref();
    assert!(store.count_by(DocType::SymbolIndex, Some("acme/doomed")).await.unwrap() > 0);

    // Dropping the clone removes the repo from the desired set.
    std::fs::remove_dir_all(&dir).unwrap();
    let outcome = harness.ingest_all().await;
    assert_eq!(outcome.counters.repos_deleted, 1);

    for doc_type in DocType::indexed() {
        assert_eq!(
            store.count_by(doc_type, Some("acme/doomed")).await.unwrap(),
            0,
            "{} documents survived the purge",
            doc_type.name()
        );
    }
    // The other repo is untouched.
    assert_eq!(store.count_by(DocType::RepoSummary, Some("acme/kept")).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// S5: LLM outage degrades, never fails
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn llm_outage_degrades_to_basic_summaries() {
    let harness = Harness::new();
    seed_repo(
        harness.repos_path(),
        "acme/dark",
        &[
            ("a.py", "def a():\n    return 1\n"),
            ("b.py", "def b():\n    return 2\n"),
            ("c.py", "def c():\n    return 3\n"),
        ],
    );

    let outcome = harness
        .pipeline_with(Box::new(DownLlm))
        .run(&PipelineOptions { target: IngestTarget::All, dry_run: false, skip_existing: false })
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::CompletedWithErrors);
    assert!(outcome.errors.iter().any(|e| e.message.contains("circuit breaker opened")));

    // Everything still got indexed, at basic quality without the LLM.
    let store = harness.store.as_ref();
    assert_eq!(store.count_by(DocType::FileIndex, Some("acme/dark")).await.unwrap(), 3);
    for doc in store.list_by_type(DocType::FileIndex).await.unwrap() {
        assert_eq!(doc.quality.enrichment_level, codeloom_engine::EnrichmentLevel::Basic);
        assert!(!doc.quality.llm_available);
        assert!(!doc.content.is_empty());
    }
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_writes_nothing_to_the_store() {
    let harness = Harness::new();
    seed_repo(harness.repos_path(), "acme/dry", &[("x.py", "def x():\n    return 1\n")]);

    let outcome = harness
        .pipeline_with(Box::new(EchoLlm))
        .run(&PipelineOptions { target: IngestTarget::All, dry_run: true, skip_existing: false })
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.files_processed, 1);
    assert_eq!(harness.store.write_count(), 0);
    assert_eq!(harness.store.len(), 0);
}

// ---------------------------------------------------------------------------
// Criticality sidecar lands scores on module summaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn criticality_scores_are_written() {
    let harness = Harness::new();
    seed_repo(
        harness.repos_path(),
        "acme/graph",
        &[
            ("api/routes.py", "from core import models\n\ndef route():\n    return models\n"),
            ("core/models.py", "def model():\n    return {}\n"),
        ],
    );

    harness.ingest_all().await;

    let modules =
        harness.store.list_by_repo(DocType::ModuleSummary, "acme/graph").await.unwrap();
    assert!(!modules.is_empty());
    assert!(modules.iter().all(|m| m.criticality_score.is_some()));

    let score = |p: &str| {
        modules
            .iter()
            .find(|m| m.module_path.as_deref() == Some(p))
            .unwrap()
            .criticality_score
            .unwrap()
    };
    // core is imported by api and outranks it.
    assert!(score("core") > score("api"));
}
