//! Git subprocess layer
//!
//! The pipeline touches repositories only through a fixed set of
//! non-interactive git invocations: `clone --depth 1`, `fetch origin`,
//! `rev-parse HEAD`, `log -1 --format=%H -- <path>`, `show <commit>:<path>`,
//! `diff --name-status` and `ls-files`. File content is always read from the
//! object store at a pinned commit, never from the working tree.
//!
//! Every subprocess is spawned with `kill_on_drop` and raced against the
//! shared cancellation token, so an interrupted run never leaves children
//! behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};

/// Status letter of a changed path in `diff --name-status` output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Other,
}

impl FileStatus {
    fn from_char(c: char) -> Self {
        match c {
            'A' => Self::Added,
            'M' => Self::Modified,
            'D' => Self::Deleted,
            'R' => Self::Renamed,
            _ => Self::Other,
        }
    }
}

/// One path changed between two commits
#[derive(Debug, Clone)]
pub struct ChangedPath {
    pub status: FileStatus,
    /// New path for renames, the (only) path otherwise
    pub path: String,
    /// Prior path, present only for renames
    pub old_path: Option<String>,
}

/// Build a clone URL for `owner/name`, weaving in the configured credential
/// for private repositories.
pub fn clone_url(repo_id: &str, credential: Option<&str>) -> String {
    match credential {
        Some(token) if !token.is_empty() => {
            format!("https://{token}@github.com/{repo_id}.git")
        }
        _ => format!("https://github.com/{repo_id}.git"),
    }
}

/// Handle to one on-disk clone
#[derive(Clone)]
pub struct GitRepo {
    dir: PathBuf,
    cancel: CancellationToken,
}

impl GitRepo {
    /// Open an existing clone.
    pub fn open(dir: &Path, cancel: CancellationToken) -> Result<Self> {
        if !dir.join(".git").exists() {
            return Err(IngestError::operation(
                format!("git open {}", dir.display()),
                "not a git repository",
            ));
        }
        Ok(Self { dir: dir.to_path_buf(), cancel })
    }

    /// Shallow-clone `url` into `target` and return a handle to it.
    pub async fn clone_shallow(
        url: &str,
        target: &Path,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let target_str = target.to_string_lossy().into_owned();
        run_git(None, &["clone", "--depth", "1", url, &target_str], &cancel).await?;
        Self::open(target, cancel)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `git fetch origin` so HEAD tracking matches the remote default branch.
    pub async fn fetch_origin(&self) -> Result<()> {
        self.run(&["fetch", "origin"]).await.map(|_| ())
    }

    /// Current HEAD commit hash.
    pub async fn head_commit(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_owned())
    }

    /// Last commit that touched `path`, or `None` for untracked paths.
    ///
    /// This is the commit that goes into file/symbol document identities;
    /// using HEAD instead would churn every document on every run.
    pub async fn last_commit_for_path(&self, path: &str) -> Result<Option<String>> {
        let out = self.run(&["log", "-1", "--format=%H", "--", path]).await?;
        let hash = String::from_utf8_lossy(&out).trim().to_owned();
        Ok(if hash.is_empty() { None } else { Some(hash) })
    }

    /// File bytes at a pinned commit via `git show <commit>:<path>`.
    ///
    /// A path absent at that commit is a data condition, not a failure.
    pub async fn show(&self, commit: &str, path: &str) -> Result<Vec<u8>> {
        let spec = format!("{commit}:{path}");
        self.run(&["show", &spec]).await.map_err(|e| match e {
            IngestError::Operation { message, .. } => {
                IngestError::data(format!("show {spec}"), message)
            }
            other => other,
        })
    }

    /// Paths changed between two commits. Fails when `from` is unreachable
    /// (e.g. pruned by a shallow fetch); callers treat that as a full
    /// re-ingest trigger.
    pub async fn diff_name_status(&self, from: &str, to: &str) -> Result<Vec<ChangedPath>> {
        let range = format!("{from}..{to}");
        let out = self.run(&["diff", "--name-status", "-M", &range]).await?;
        Ok(parse_name_status(&String::from_utf8_lossy(&out)))
    }

    /// All tracked paths, the denominator of the change ratio.
    pub async fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run(&["ls-files"]).await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        run_git(Some(&self.dir), args, &self.cancel).await
    }
}

/// Parse `diff --name-status` output. Rename lines carry a score
/// (`R100\told\tnew`); everything else is `X\tpath`.
fn parse_name_status(output: &str) -> Vec<ChangedPath> {
    let mut changes = Vec::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let Some(status_field) = fields.next() else { continue };
        let Some(status_char) = status_field.chars().next() else { continue };
        let status = FileStatus::from_char(status_char);

        match status {
            FileStatus::Renamed => {
                if let (Some(old), Some(new)) = (fields.next(), fields.next()) {
                    changes.push(ChangedPath {
                        status,
                        path: new.to_owned(),
                        old_path: Some(old.to_owned()),
                    });
                }
            }
            _ => {
                if let Some(path) = fields.next() {
                    changes.push(ChangedPath { status, path: path.to_owned(), old_path: None });
                }
            }
        }
    }
    changes
}

/// Spawn git non-interactively and race it against cancellation. The child
/// is killed when the future is dropped mid-flight.
async fn run_git(dir: Option<&Path>, args: &[&str], cancel: &CancellationToken) -> Result<Vec<u8>> {
    let context = format!("git {}", args.first().copied().unwrap_or(""));

    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| IngestError::transient(context.clone(), e))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(IngestError::operation(context, "cancelled"));
        }
        out = child.wait_with_output() => {
            out.map_err(|e| IngestError::transient(context.clone(), e))?
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::operation(context, stderr.trim()));
    }

    Ok(output.stdout)
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    fn init_test_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        git(temp.path(), &["init"]);
        git(temp.path(), &["config", "user.email", "test@test.com"]);
        git(temp.path(), &["config", "user.name", "Test"]);
        std::fs::write(temp.path().join("a.py"), "def a():\n    pass\n").unwrap();
        std::fs::write(temp.path().join("b.py"), "def b():\n    pass\n").unwrap();
        git(temp.path(), &["add", "."]);
        git(temp.path(), &["commit", "-m", "initial"]);
        temp
    }

    #[tokio::test]
    async fn test_open_requires_git_dir() {
        let temp = TempDir::new().unwrap();
        assert!(GitRepo::open(temp.path(), CancellationToken::new()).is_err());
        let repo = init_test_repo();
        assert!(GitRepo::open(repo.path(), CancellationToken::new()).is_ok());
    }

    #[tokio::test]
    async fn test_head_and_ls_files() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let head = repo.head_commit().await.unwrap();
        assert_eq!(head.len(), 40);
        let files = repo.ls_files().await.unwrap();
        assert_eq!(files, vec!["a.py".to_string(), "b.py".to_string()]);
    }

    #[tokio::test]
    async fn test_per_file_commit_is_stable_across_unrelated_commits() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let first = repo.last_commit_for_path("a.py").await.unwrap().unwrap();

        // Touch only b.py; a.py's pinned commit must not move.
        std::fs::write(temp.path().join("b.py"), "def b():\n    return 1\n").unwrap();
        git(temp.path(), &["add", "."]);
        git(temp.path(), &["commit", "-m", "change b"]);

        let second = repo.last_commit_for_path("a.py").await.unwrap().unwrap();
        assert_eq!(first, second);
        let b_commit = repo.last_commit_for_path("b.py").await.unwrap().unwrap();
        assert_ne!(b_commit, first);
    }

    #[tokio::test]
    async fn test_show_reads_pinned_commit_not_working_tree() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let commit = repo.head_commit().await.unwrap();

        // Diverge the working tree without committing.
        std::fs::write(temp.path().join("a.py"), "garbage").unwrap();

        let bytes = repo.show(&commit, "a.py").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&bytes), "def a():\n    pass\n");
    }

    #[tokio::test]
    async fn test_show_missing_path_is_data_error() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let commit = repo.head_commit().await.unwrap();
        let err = repo.show(&commit, "missing.py").await.unwrap_err();
        assert_eq!(err.class(), "data");
    }

    #[tokio::test]
    async fn test_diff_name_status() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let from = repo.head_commit().await.unwrap();

        std::fs::write(temp.path().join("a.py"), "def a():\n    return 2\n").unwrap();
        std::fs::write(temp.path().join("c.py"), "def c():\n    pass\n").unwrap();
        std::fs::remove_file(temp.path().join("b.py")).unwrap();
        git(temp.path(), &["add", "-A"]);
        git(temp.path(), &["commit", "-m", "mixed changes"]);
        let to = repo.head_commit().await.unwrap();

        let changes = repo.diff_name_status(&from, &to).await.unwrap();
        let find = |p: &str| changes.iter().find(|c| c.path == p).unwrap();
        assert_eq!(find("a.py").status, FileStatus::Modified);
        assert_eq!(find("c.py").status, FileStatus::Added);
        assert_eq!(find("b.py").status, FileStatus::Deleted);
    }

    #[tokio::test]
    async fn test_diff_unreachable_commit_fails() {
        let temp = init_test_repo();
        let repo = GitRepo::open(temp.path(), CancellationToken::new()).unwrap();
        let to = repo.head_commit().await.unwrap();
        let bogus = "0123456789abcdef0123456789abcdef01234567";
        assert!(repo.diff_name_status(bogus, &to).await.is_err());
    }

    #[test]
    fn test_parse_name_status_rename() {
        let parsed = parse_name_status("R100\tsrc/old.py\tsrc/new.py\nM\tsrc/kept.py\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].status, FileStatus::Renamed);
        assert_eq!(parsed[0].path, "src/new.py");
        assert_eq!(parsed[0].old_path.as_deref(), Some("src/old.py"));
        assert_eq!(parsed[1].status, FileStatus::Modified);
        assert!(parsed[1].old_path.is_none());
    }

    #[test]
    fn test_clone_url_credential() {
        assert_eq!(clone_url("acme/hello", None), "https://github.com/acme/hello.git");
        assert_eq!(
            clone_url("acme/hello", Some("tok123")),
            "https://tok123@github.com/acme/hello.git"
        );
    }
}
