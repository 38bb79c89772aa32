//! Repository reconciler
//!
//! Compares three sets — the desired repositories, the clones on disk and
//! the repos present in the index — and produces one action per repo in the
//! union. The desired set comes from the first available source: HTTP API,
//! list file, then the disk layout itself.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::Settings;
use crate::error::{IngestError, Result};
use crate::store::DocumentStore;
use crate::types::{folder_to_repo_id, DocType};

/// What to do with one repository this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoAction {
    /// Desired but missing on disk: shallow-clone, then process fully
    CloneAndProcess,
    /// Desired and cloned but absent from the index: full ingest
    Process,
    /// Desired, cloned and indexed: the change detector decides
    Defer,
    /// No longer desired but still indexed: repo-scoped purge
    DeleteIndexed,
    /// On disk only; not ours to delete
    Ignore,
}

#[derive(Debug, Clone)]
pub struct RepoPlan {
    pub repo_id: String,
    pub action: RepoAction,
}

/// Resolve the desired repository set. Sources in precedence order:
/// `REPOS_LIST_API`, `REPOS_LIST_FILE`, the `REPOS_PATH` listing. The
/// optional sources degrade with a warning instead of failing the run.
pub async fn desired_set(settings: &Settings, client: &reqwest::Client) -> Result<Vec<String>> {
    if let Some(api) = &settings.repos_list_api {
        match fetch_desired_from_api(client, api).await {
            Ok(repos) => return Ok(repos),
            Err(e) => log::warn!("repo list API unavailable ({e}); falling back"),
        }
    }

    if let Some(file) = &settings.repos_list_file {
        match std::fs::read_to_string(file) {
            Ok(text) => return Ok(parse_repo_list(&text)),
            Err(e) => log::warn!("repo list file {} unreadable ({e}); falling back", file.display()),
        }
    }

    disk_set(&settings.repos_path)
}

async fn fetch_desired_from_api(client: &reqwest::Client, url: &str) -> Result<Vec<String>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| IngestError::transient("repo list API", e))?;
    if !response.status().is_success() {
        return Err(IngestError::transient("repo list API", response.status()));
    }
    response
        .json::<Vec<String>>()
        .await
        .map_err(|e| IngestError::operation("repo list API", e))
}

/// One `owner/name` per line; `#` starts a comment.
pub fn parse_repo_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty() && line.contains('/'))
        .map(str::to_owned)
        .collect()
}

/// Repo ids of the clones under `repos_path` (directories containing `.git`).
pub fn disk_set(repos_path: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(repos_path).map_err(|e| {
        IngestError::Config(format!("REPOS_PATH {} unreadable: {e}", repos_path.display()))
    })?;

    let mut repos = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join(".git").exists() {
            if let Some(folder) = path.file_name().and_then(|n| n.to_str()) {
                repos.push(folder_to_repo_id(folder));
            }
        }
    }
    repos.sort();
    Ok(repos)
}

/// Repo ids with a `repo_summary` in the store.
pub async fn indexed_set(store: &dyn DocumentStore) -> Result<Vec<String>> {
    store.distinct_repo_ids(DocType::RepoSummary).await
}

/// The reconciliation table. Desired repos keep their given order; repos to
/// purge follow, sorted; on-disk orphans come last as explicit no-ops.
pub fn plan(desired: &[String], disk: &[String], indexed: &[String]) -> Vec<RepoPlan> {
    let desired_set: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let disk_set: BTreeSet<&str> = disk.iter().map(String::as_str).collect();
    let indexed_set: BTreeSet<&str> = indexed.iter().map(String::as_str).collect();

    let mut plans = Vec::new();

    for repo_id in desired {
        let action = match (disk_set.contains(repo_id.as_str()), indexed_set.contains(repo_id.as_str())) {
            (false, _) => RepoAction::CloneAndProcess,
            (true, false) => RepoAction::Process,
            (true, true) => RepoAction::Defer,
        };
        plans.push(RepoPlan { repo_id: repo_id.clone(), action });
    }

    for repo_id in &indexed_set {
        if !desired_set.contains(repo_id) {
            plans.push(RepoPlan { repo_id: (*repo_id).to_owned(), action: RepoAction::DeleteIndexed });
        }
    }

    for repo_id in &disk_set {
        if !desired_set.contains(repo_id) && !indexed_set.contains(repo_id) {
            plans.push(RepoPlan { repo_id: (*repo_id).to_owned(), action: RepoAction::Ignore });
        }
    }

    plans
}
