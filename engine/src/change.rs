//! Change detector
//!
//! For a repo that is both cloned and indexed, decide between skipping
//! (HEAD unchanged), a surgical update (few files changed) and a full
//! re-ingest (change ratio above threshold, or history unreachable).

use crate::error::Result;
use crate::git::{ChangedPath, GitRepo};
use crate::store::DocumentStore;
use crate::types::DocType;

/// How to bring one indexed repo up to date
#[derive(Debug, Clone)]
pub enum ChangeStrategy {
    /// HEAD equals the stored commit; nothing to do
    Skip,
    /// Reprocess only these paths, then regenerate affected parents
    Surgical(Vec<ChangedPath>),
    /// Drop the increment and process every file
    FullReingest { reason: String },
}

#[derive(Debug, Clone)]
pub struct ChangeDecision {
    /// HEAD after fetch; becomes the commit of the new summaries
    pub head: String,
    pub strategy: ChangeStrategy,
}

/// Commit recorded in the repo's current `repo_summary`, if any.
pub async fn stored_commit(store: &dyn DocumentStore, repo_id: &str) -> Result<Option<String>> {
    Ok(store
        .find_one(DocType::RepoSummary, repo_id, None)
        .await?
        .map(|doc| doc.commit_hash))
}

/// Whether a change set is too large to update surgically.
pub fn exceeds_threshold(changed: usize, tracked: usize, threshold: f64) -> bool {
    if tracked == 0 {
        return true;
    }
    changed as f64 / tracked as f64 > threshold
}

/// Decide the update strategy. The caller has already fetched.
pub async fn detect(repo: &GitRepo, stored: &str, threshold: f64) -> Result<ChangeDecision> {
    let head = repo.head_commit().await?;
    if head == stored {
        return Ok(ChangeDecision { head, strategy: ChangeStrategy::Skip });
    }

    let changes = match repo.diff_name_status(stored, &head).await {
        Ok(changes) => changes,
        Err(e) => {
            // Shallow fetches prune history; an unreachable stored commit
            // means the increment cannot be trusted.
            log::warn!("diff against stored commit failed ({e}); full re-ingest");
            return Ok(ChangeDecision {
                head,
                strategy: ChangeStrategy::FullReingest {
                    reason: "stored commit unreachable".to_owned(),
                },
            });
        }
    };

    let tracked = repo.ls_files().await?.len();
    if exceeds_threshold(changes.len(), tracked, threshold) {
        return Ok(ChangeDecision {
            head,
            strategy: ChangeStrategy::FullReingest {
                reason: format!("{} of {tracked} tracked files changed", changes.len()),
            },
        });
    }

    Ok(ChangeDecision { head, strategy: ChangeStrategy::Surgical(changes) })
}
