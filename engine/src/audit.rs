//! Per-run audit record
//!
//! One `ingestion_log` document per run: created with `status = "running"`
//! before any repository work, finalized with a terminal status, counters
//! and the error list. A run that dies between the two leaves a `running`
//! row; the next run's sweep marks it `interrupted` once its pid is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{IngestError, Result};
use crate::lock::pid_alive;
use crate::store::DocumentStore;
use crate::types::{DocType, Document, ErrorRecord, RunCounters, RunStatus};

/// Live run counters. All fields are atomics so file workers update them
/// without coordination; `snapshot` flattens them for persistence.
#[derive(Debug, Default)]
pub struct Counters {
    pub repos_processed: AtomicU64,
    pub repos_skipped: AtomicU64,
    pub repos_updated: AtomicU64,
    pub repos_full_reingest: AtomicU64,
    pub repos_cloned: AtomicU64,
    pub repos_deleted: AtomicU64,
    pub repos_error: AtomicU64,
    pub files_processed: AtomicU64,
    pub files_deleted: AtomicU64,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, record: ErrorRecord) {
        self.errors.lock().unwrap().push(record);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap().is_empty()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> RunCounters {
        RunCounters {
            repos_processed: self.repos_processed.load(Ordering::Relaxed),
            repos_skipped: self.repos_skipped.load(Ordering::Relaxed),
            repos_updated: self.repos_updated.load(Ordering::Relaxed),
            repos_full_reingest: self.repos_full_reingest.load(Ordering::Relaxed),
            repos_cloned: self.repos_cloned.load(Ordering::Relaxed),
            repos_deleted: self.repos_deleted.load(Ordering::Relaxed),
            repos_error: self.repos_error.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Writer for one run's `ingestion_log` row
pub struct AuditLog {
    run_id: String,
    started_at: DateTime<Utc>,
}

impl AuditLog {
    /// Timestamp+pid run identifier; unique per host thanks to the run lock.
    pub fn new_run_id() -> String {
        format!("run-{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"), std::process::id())
    }

    /// Create the `running` row. Failure here is fatal: a run that cannot
    /// write its audit record must not touch any repository.
    pub async fn start(store: &dyn DocumentStore, run_id: &str) -> Result<Self> {
        let started_at = Utc::now();
        let mut doc = run_document(run_id);
        doc.metadata.status = Some(RunStatus::Running);
        doc.metadata.started_at = Some(started_at.to_rfc3339());
        doc.metadata.pid = Some(std::process::id());

        store
            .upsert(&doc)
            .await
            .map_err(|e| IngestError::Fatal(format!("cannot write audit record: {e}")))?;

        Ok(Self { run_id: run_id.to_owned(), started_at })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Rewrite the row with a terminal status and final counters.
    pub async fn finalize(
        &self,
        store: &dyn DocumentStore,
        status: RunStatus,
        counters: RunCounters,
        errors: Vec<ErrorRecord>,
        notes: Option<String>,
    ) -> Result<()> {
        let finished_at = Utc::now();
        let mut doc = run_document(&self.run_id);
        doc.metadata.status = Some(status);
        doc.metadata.counters = Some(counters);
        doc.metadata.errors = Some(errors);
        doc.metadata.started_at = Some(self.started_at.to_rfc3339());
        doc.metadata.finished_at = Some(finished_at.to_rfc3339());
        doc.metadata.duration_seconds =
            Some((finished_at - self.started_at).num_milliseconds() as f64 / 1000.0);
        doc.metadata.pid = Some(std::process::id());
        doc.metadata.notes = notes;
        store.upsert(&doc).await
    }

    /// Mark `running` rows of dead processes as `interrupted`. Returns how
    /// many rows were repaired.
    pub async fn sweep_stale(store: &dyn DocumentStore) -> Result<u64> {
        let mut repaired = 0;
        for mut doc in store.list_by_type(DocType::IngestionLog).await? {
            let running = doc.metadata.status == Some(RunStatus::Running);
            let dead = doc.metadata.pid.is_none_or(|pid| !pid_alive(pid));
            if running && dead {
                log::warn!(
                    "marking orphaned run {} as interrupted",
                    doc.metadata.run_id.as_deref().unwrap_or("?")
                );
                doc.metadata.status = Some(RunStatus::Interrupted);
                doc.metadata.notes =
                    Some("finalized by a later run; original process died".to_owned());
                store.upsert(&doc).await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

fn run_document(run_id: &str) -> Document {
    let mut doc = Document::new(DocType::IngestionLog, "", run_id, "");
    doc.metadata.run_id = Some(run_id.to_owned());
    doc
}
