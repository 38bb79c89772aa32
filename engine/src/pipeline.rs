//! Pipeline orchestrator
//!
//! Drives one run end to end: lock → audit start → reconcile → per-repo
//! change detection → bounded file fan-out → aggregation → criticality →
//! audit finalize. Repositories run strictly in series; files inside a
//! repository run under the file semaphore. One cancellation token threads
//! through every suspension point, and every exit path releases the lock
//! and finalizes the audit row.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, Counters};
use crate::change::{self, ChangeStrategy};
use crate::chunker::{UnderChunkDetector, UnderChunkThresholds};
use crate::config::Settings;
use crate::criticality;
use crate::embed::Embedder;
use crate::error::{IngestError, Result};
use crate::git::{clone_url, ChangedPath, FileStatus, GitRepo};
use crate::llm::Enricher;
use crate::lock::RunLock;
use crate::processor::{FileOutcome, FileProcessor};
use crate::reconcile::{self, RepoAction};
use crate::store::DocumentStore;
use crate::types::{DocType, ErrorRecord, RunCounters, RunStatus};

/// Which repositories one `ingest` invocation covers
#[derive(Debug, Clone)]
pub enum IngestTarget {
    All,
    Repo(String),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub target: IngestTarget,
    /// Reconcile, detect, parse and summarize, but never write to the store
    pub dry_run: bool,
    /// Skip repos whose `repo_summary` already matches the local HEAD
    pub skip_existing: bool,
}

/// Final report of one run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub counters: RunCounters,
    pub errors: Vec<ErrorRecord>,
    pub llm_tokens: u64,
}

pub struct Pipeline {
    settings: Settings,
    store: Arc<dyn DocumentStore>,
    enricher: Arc<Enricher>,
    embedder: Arc<dyn Embedder>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        store: Arc<dyn DocumentStore>,
        enricher: Arc<Enricher>,
        embedder: Arc<dyn Embedder>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Fatal(format!("http client: {e}")))?;
        Ok(Self { settings, store, enricher, embedder, cancel, http })
    }

    /// Execute one run. Errors escape only for lock contention,
    /// configuration problems and fatal startup conditions; everything
    /// else degrades into the outcome's error list.
    pub async fn run(&self, options: &PipelineOptions) -> Result<RunOutcome> {
        let lock = RunLock::acquire(&self.settings.lock_path())?;

        let outcome = self.run_locked(options).await;

        // The guard also releases on early return; this keeps the success
        // path explicit.
        lock.release();
        outcome
    }

    async fn run_locked(&self, options: &PipelineOptions) -> Result<RunOutcome> {
        self.store.ping().await?;

        let audit = if options.dry_run {
            None
        } else {
            if let Err(e) = AuditLog::sweep_stale(self.store.as_ref()).await {
                log::warn!("stale-run sweep failed: {e}");
            }
            Some(AuditLog::start(self.store.as_ref(), &AuditLog::new_run_id()).await?)
        };

        let counters = Counters::new();
        let plans = match self.build_plan(options).await {
            Ok(plans) => plans,
            Err(e) => {
                // The audit row must not be left `running` on this path.
                if let Some(audit) = &audit {
                    let _ = audit
                        .finalize(
                            self.store.as_ref(),
                            RunStatus::Failed,
                            counters.snapshot(),
                            vec![e.to_record("reconcile")],
                            None,
                        )
                        .await;
                }
                return Err(e);
            }
        };

        let mut fatal: Option<IngestError> = None;
        for plan in &plans {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.execute_repo(plan.repo_id.as_str(), plan.action, options, &counters).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    log::error!("{}: {} ({})", plan.repo_id, e, e.class());
                    counters.repos_error.fetch_add(1, Ordering::Relaxed);
                    counters.record_error(e.to_record(plan.repo_id.clone()));
                }
            }
        }

        if let Some(event) = self.enricher.breaker_event() {
            counters.record_error(event);
        }

        let status = if fatal.is_some() {
            RunStatus::Failed
        } else if self.cancel.is_cancelled() {
            RunStatus::Interrupted
        } else if counters.has_errors() {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let snapshot = counters.snapshot();
        let errors = counters.errors();
        if let Some(audit) = &audit {
            let notes = Some("renamed symbols are conservatively deleted and recreated".to_owned());
            if let Err(e) = audit
                .finalize(self.store.as_ref(), status, snapshot, errors.clone(), notes)
                .await
            {
                log::error!("audit finalize failed: {e}");
            }
        }

        if let Some(fatal) = fatal {
            return Err(fatal);
        }

        Ok(RunOutcome {
            status,
            counters: snapshot,
            errors,
            llm_tokens: self.enricher.tokens_used(),
        })
    }

    async fn build_plan(&self, options: &PipelineOptions) -> Result<Vec<reconcile::RepoPlan>> {
        let desired = match &options.target {
            IngestTarget::Repo(repo_id) => vec![repo_id.clone()],
            IngestTarget::All => reconcile::desired_set(&self.settings, &self.http).await?,
        };
        let disk = reconcile::disk_set(&self.settings.repos_path)?;
        let indexed = reconcile::indexed_set(self.store.as_ref()).await?;

        // A named target only ever touches that one repo.
        let plans = reconcile::plan(&desired, &disk, &indexed);
        Ok(match &options.target {
            IngestTarget::Repo(repo_id) => {
                plans.into_iter().filter(|p| &p.repo_id == repo_id).collect()
            }
            IngestTarget::All => plans,
        })
    }

    async fn execute_repo(
        &self,
        repo_id: &str,
        action: RepoAction,
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        match action {
            RepoAction::Ignore => {
                log::info!("{repo_id}: on disk but not desired or indexed; leaving alone");
                Ok(())
            }
            RepoAction::DeleteIndexed => self.delete_indexed(repo_id, options, counters).await,
            RepoAction::CloneAndProcess => {
                let dir = self.settings.repo_dir(repo_id);
                let url = clone_url(repo_id, self.settings.git_credential.as_deref());
                log::info!("{repo_id}: cloning");
                let repo = GitRepo::clone_shallow(&url, &dir, self.cancel.clone()).await?;
                counters.repos_cloned.fetch_add(1, Ordering::Relaxed);
                self.ingest_repo(repo_id, repo, None, options, counters).await
            }
            RepoAction::Process => {
                let repo = self.open_and_fetch(repo_id).await?;
                self.ingest_repo(repo_id, repo, None, options, counters).await
            }
            RepoAction::Defer => self.defer_to_change_detector(repo_id, options, counters).await,
        }
    }

    async fn open_and_fetch(&self, repo_id: &str) -> Result<GitRepo> {
        let repo = GitRepo::open(&self.settings.repo_dir(repo_id), self.cancel.clone())?;
        // An unreachable remote falls back to the local HEAD rather than
        // failing the repo; change detection still works against it.
        if let Err(e) = repo.fetch_origin().await {
            log::warn!("{repo_id}: fetch failed ({e}); proceeding with local HEAD");
        }
        Ok(repo)
    }

    async fn defer_to_change_detector(
        &self,
        repo_id: &str,
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        let stored = change::stored_commit(self.store.as_ref(), repo_id).await?;

        if options.skip_existing {
            // Short-circuit on the local HEAD without a fetch.
            let repo = GitRepo::open(&self.settings.repo_dir(repo_id), self.cancel.clone())?;
            let head = repo.head_commit().await?;
            if stored.as_deref() == Some(head.as_str()) {
                log::info!("{repo_id}: repo_summary already at HEAD, skipping");
                counters.repos_processed.fetch_add(1, Ordering::Relaxed);
                counters.repos_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let repo = self.open_and_fetch(repo_id).await?;
        let Some(stored) = stored else {
            // Indexed set said yes but the summary is gone; treat as fresh.
            return self.ingest_repo(repo_id, repo, None, options, counters).await;
        };

        let decision =
            change::detect(&repo, &stored, self.settings.full_reingest_threshold).await?;
        match decision.strategy {
            ChangeStrategy::Skip => {
                log::info!("{repo_id}: unchanged at {}", &decision.head[..12.min(decision.head.len())]);
                counters.repos_processed.fetch_add(1, Ordering::Relaxed);
                counters.repos_skipped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            ChangeStrategy::FullReingest { reason } => {
                log::info!("{repo_id}: full re-ingest ({reason})");
                counters.repos_full_reingest.fetch_add(1, Ordering::Relaxed);
                self.ingest_repo(repo_id, repo, None, options, counters).await
            }
            ChangeStrategy::Surgical(changes) => {
                log::info!("{repo_id}: surgical update, {} changed paths", changes.len());
                counters.repos_updated.fetch_add(1, Ordering::Relaxed);
                self.ingest_repo(repo_id, repo, Some(changes), options, counters).await
            }
        }
    }

    /// Process a repository: all tracked files, or only a surgical change
    /// set. Aggregation and the criticality sidecar follow file work.
    async fn ingest_repo(
        &self,
        repo_id: &str,
        repo: GitRepo,
        changes: Option<Vec<ChangedPath>>,
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        let repo = Arc::new(repo);
        let head = repo.head_commit().await?;

        let mut to_process: Vec<String> = Vec::new();
        match &changes {
            None => to_process = repo.ls_files().await?,
            Some(changes) => {
                for change in changes {
                    match change.status {
                        FileStatus::Added | FileStatus::Modified => {
                            to_process.push(change.path.clone());
                        }
                        FileStatus::Deleted => {
                            self.purge_file(repo_id, &change.path, options, counters).await?;
                        }
                        FileStatus::Renamed => {
                            if let Some(old) = &change.old_path {
                                self.purge_file(repo_id, old, options, counters).await?;
                            }
                            to_process.push(change.path.clone());
                        }
                        FileStatus::Other => {
                            log::warn!("{repo_id}: unhandled change status for {}", change.path);
                        }
                    }
                }
            }
        }

        self.process_files(repo_id, &repo, &to_process, options, counters).await?;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let aggregator = crate::aggregate::Aggregator {
            repo_id: repo_id.to_owned(),
            enricher: self.enricher.clone(),
            embedder: self.embedder.clone(),
            store: self.store.clone(),
            dry_run: options.dry_run,
        };
        aggregator.aggregate(&head).await?;

        // Additive sidecar: log and move on, never block the run.
        if !options.dry_run {
            if let Err(e) = criticality::backfill_repo(self.store.as_ref(), repo_id).await {
                log::warn!("{repo_id}: criticality sidecar failed: {e}");
            }
        }

        counters.repos_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bounded fan-out over one repo's files.
    async fn process_files(
        &self,
        repo_id: &str,
        repo: &Arc<GitRepo>,
        paths: &[String],
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        let total = paths.len();
        if total == 0 {
            return Ok(());
        }

        let processor = Arc::new(FileProcessor {
            repo_id: repo_id.to_owned(),
            enricher: self.enricher.clone(),
            embedder: self.embedder.clone(),
            store: self.store.clone(),
            detector: Arc::new(UnderChunkDetector::new(UnderChunkThresholds {
                min_bytes: self.settings.under_chunk_min_bytes,
                max_lines_per_symbol: self.settings.under_chunk_max_lines_per_symbol,
                format_calls: self.settings.under_chunk_format_calls,
            })),
            parse_sem: Arc::new(Semaphore::new(self.settings.parse_workers)),
            symbol_min_lines: self.settings.symbol_min_lines,
            dry_run: options.dry_run,
        });

        let file_sem = Arc::new(Semaphore::new(self.settings.concurrency_files));
        let mut workers: JoinSet<(usize, String, Result<FileOutcome>)> = JoinSet::new();

        for (index, path) in paths.iter().enumerate() {
            // Cancellation stops launching; in-flight workers drain below.
            if self.cancel.is_cancelled() {
                break;
            }
            let permit = file_sem.clone().acquire_owned().await.map_err(|_| {
                IngestError::operation(repo_id.to_owned(), "file semaphore closed")
            })?;
            let processor = processor.clone();
            let repo = repo.clone();
            let path = path.clone();
            workers.spawn(async move {
                let result = processor.process(&repo, &path).await;
                drop(permit);
                (index, path, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (index, path, result) = match joined {
                Ok(entry) => entry,
                Err(e) => {
                    log::error!("{repo_id}: file worker panicked: {e}");
                    continue;
                }
            };
            match result {
                Ok(FileOutcome::Processed { symbols, .. }) => {
                    counters.files_processed.fetch_add(1, Ordering::Relaxed);
                    log::info!("[{}/{total}] {path} (ok, {symbols} symbols)", index + 1);
                }
                Ok(FileOutcome::Protected) | Ok(FileOutcome::SkippedBinary) => {
                    log::info!("[{}/{total}] {path} (skip, 0 symbols)", index + 1);
                }
                Err(e) if self.cancel.is_cancelled() => {
                    log::info!("[{}/{total}] {path} (cancelled: {})", index + 1, e.class());
                }
                Err(e) => {
                    log::warn!("[{}/{total}] {path} (err, {})", index + 1, e.class());
                    counters.record_error(e.to_record(format!("{repo_id}:{path}")));
                }
            }
        }

        Ok(())
    }

    /// Delete every document for one file path.
    async fn purge_file(
        &self,
        repo_id: &str,
        path: &str,
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        if options.dry_run {
            log::info!("{repo_id}: would delete documents for {path}");
            return Ok(());
        }
        self.store.delete_by_query(repo_id, DocType::SymbolIndex, Some(path)).await?;
        let files = self.store.delete_by_query(repo_id, DocType::FileIndex, Some(path)).await?;
        let docs = self.store.delete_by_query(repo_id, DocType::Document, Some(path)).await?;
        counters.files_deleted.fetch_add(files + docs, Ordering::Relaxed);
        Ok(())
    }

    /// Repo-scoped purge across every document type.
    async fn delete_indexed(
        &self,
        repo_id: &str,
        options: &PipelineOptions,
        counters: &Counters,
    ) -> Result<()> {
        if options.dry_run {
            log::info!("{repo_id}: would purge all indexed documents");
            return Ok(());
        }
        let mut files_deleted = 0;
        for doc_type in DocType::indexed() {
            let deleted = self.store.delete_by_query(repo_id, doc_type, None).await?;
            if matches!(doc_type, DocType::FileIndex | DocType::Document) {
                files_deleted += deleted;
            }
        }
        counters.files_deleted.fetch_add(files_deleted, Ordering::Relaxed);
        counters.repos_deleted.fetch_add(1, Ordering::Relaxed);
        log::info!("{repo_id}: purged from index");
        Ok(())
    }
}
