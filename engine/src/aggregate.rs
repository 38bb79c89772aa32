//! Bottom-up aggregation into module and repo summaries
//!
//! After the file workers finish, the surviving file documents are grouped
//! into the minimal directory tree and summarized leaves-first: every
//! directory in the tree gets a `module_summary` (including intermediate
//! directories holding only sub-modules), and the root collates into the
//! single `repo_summary`. Module prompts see child summaries only, never
//! code. A directory whose child-ID set is unchanged keeps its existing
//! document untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::embed::{Embedder, TextKind};
use crate::error::Result;
use crate::llm::{Enricher, SummaryTarget};
use crate::store::DocumentStore;
use crate::types::{document_id, DocType, Document, Quality};

/// Key files listed in a module's metadata
const KEY_FILES_MAX: usize = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateStats {
    pub modules_written: u64,
    pub modules_reused: u64,
}

/// Directory node in the minimal tree
#[derive(Debug, Default)]
struct DirNode {
    files: Vec<Document>,
    subdirs: BTreeSet<String>,
}

pub struct Aggregator {
    pub repo_id: String,
    pub enricher: Arc<Enricher>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn DocumentStore>,
    pub dry_run: bool,
}

impl Aggregator {
    /// Regenerate module summaries and the repo summary at `head_commit`.
    pub async fn aggregate(&self, head_commit: &str) -> Result<AggregateStats> {
        let mut stats = AggregateStats::default();

        let mut files = self.store.list_by_repo(DocType::FileIndex, &self.repo_id).await?;
        files.extend(self.store.list_by_repo(DocType::Document, &self.repo_id).await?);
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        let tree = build_tree(&files);
        if tree.is_empty() {
            log::info!("{}: no indexed files, skipping aggregation", self.repo_id);
            return Ok(stats);
        }

        // The repo summary's id is computable up front, so the root module
        // can point at its parent before that parent is written.
        let repo_doc_id = document_id(DocType::RepoSummary, &self.repo_id, ".", head_commit);

        // Leaves first: deepest paths have the most separators.
        let mut dirs: Vec<&String> = tree.keys().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(depth(d)));

        // module_path → (document_id, summary text)
        let mut produced: BTreeMap<String, (String, String)> = BTreeMap::new();

        for dir in dirs {
            let node = &tree[dir];
            let parent_id = if dir == "." {
                repo_doc_id.clone()
            } else {
                // Parents are shallower, processed later; placeholder now,
                // fixed when the parent links its children.
                String::new()
            };
            let (id, summary, wrote) =
                self.build_module(dir, node, head_commit, &produced, parent_id).await?;
            if wrote {
                stats.modules_written += 1;
            } else {
                stats.modules_reused += 1;
            }
            produced.insert(dir.clone(), (id, summary));
        }

        self.drop_vanished_modules(&tree).await?;
        self.build_repo_summary(head_commit, &repo_doc_id, &tree, &files, &produced).await?;

        Ok(stats)
    }

    /// Produce (or reuse) one module document. Returns (id, summary, wrote).
    async fn build_module(
        &self,
        dir: &str,
        node: &DirNode,
        head_commit: &str,
        produced: &BTreeMap<String, (String, String)>,
        parent_id: String,
    ) -> Result<(String, String, bool)> {
        // Children: this directory's files plus its sub-module documents.
        let mut child_ids: Vec<String> =
            node.files.iter().map(|f| f.document_id.clone()).collect();
        let mut child_summaries: Vec<String> =
            node.files.iter().map(|f| f.content.clone()).collect();
        for sub in &node.subdirs {
            if let Some((id, summary)) = produced.get(sub) {
                child_ids.push(id.clone());
                child_summaries.push(summary.clone());
            }
        }
        child_ids.sort();

        let previous = self.store.find_one(DocType::ModuleSummary, &self.repo_id, Some(dir)).await?;

        if let Some(prev) = &previous {
            let mut prev_children = prev.children_ids.clone();
            prev_children.sort();
            let unchanged = prev_children == child_ids && !prev.content.is_empty();
            if prev.quality.protect_from_update || unchanged {
                // Reused document, but its children must still name it.
                if !self.dry_run {
                    self.relink_children(prev).await?;
                }
                return Ok((prev.document_id.clone(), prev.content.clone(), false));
            }
        }

        let mut key_files: Vec<String> = node
            .files
            .iter()
            .filter_map(|f| f.file_path.as_deref())
            .map(|p| p.rsplit('/').next().unwrap_or(p).to_owned())
            .collect();
        key_files.dedup();
        key_files.truncate(KEY_FILES_MAX);

        let target = SummaryTarget::Module {
            path: dir.to_owned(),
            key_files: key_files.clone(),
            child_summaries,
        };
        let summary = self.enricher.summarize(&target).await;
        let embedding = self.embedder.embed_one(&summary.text, TextKind::Document).await?;

        let mut doc = Document::new(DocType::ModuleSummary, &self.repo_id, dir, head_commit)
            .with_content(summary.text.clone())
            .with_embedding(embedding);
        doc.module_path = Some(dir.to_owned());
        if !parent_id.is_empty() {
            doc.parent_id = Some(parent_id);
        }
        doc.children_ids = child_ids;
        doc.metadata.file_count = Some(node.files.len() as u32);
        doc.metadata.key_files = Some(key_files);
        doc.quality = Quality {
            enrichment_level: summary.level,
            llm_available: summary.llm_available,
            summary_source: "pipeline".to_owned(),
            protect_from_update: false,
        };

        if !self.dry_run {
            if previous.as_ref().is_some_and(|p| p.document_id != doc.document_id) {
                self.store
                    .delete_by_query(&self.repo_id, DocType::ModuleSummary, Some(dir))
                    .await?;
            }
            self.store.upsert(&doc).await?;
            self.relink_children(&doc).await?;
        }

        Ok((doc.document_id, summary.text, true))
    }

    /// Point every child at its (possibly new) parent id. Files that did
    /// not change keep their identity; only the parent link is refreshed.
    async fn relink_children(&self, module: &Document) -> Result<()> {
        for child_id in &module.children_ids {
            if let Some(mut child) = self.store.get(child_id).await? {
                if child.parent_id.as_deref() != Some(module.document_id.as_str()) {
                    child.parent_id = Some(module.document_id.clone());
                    self.store.upsert(&child).await?;
                }
            }
        }
        Ok(())
    }

    /// Module documents for directories that no longer hold any indexed
    /// content are stale; remove them.
    async fn drop_vanished_modules(&self, tree: &BTreeMap<String, DirNode>) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        for module in self.store.list_by_repo(DocType::ModuleSummary, &self.repo_id).await? {
            let Some(path) = module.module_path.as_deref() else { continue };
            if !tree.contains_key(path) {
                log::info!("{}: dropping empty module {path}", self.repo_id);
                self.store.delete_by_query(&self.repo_id, DocType::ModuleSummary, Some(path)).await?;
            }
        }
        Ok(())
    }

    async fn build_repo_summary(
        &self,
        head_commit: &str,
        repo_doc_id: &str,
        tree: &BTreeMap<String, DirNode>,
        files: &[Document],
        produced: &BTreeMap<String, (String, String)>,
    ) -> Result<()> {
        // First-level module names; the root counts when it holds files.
        let root = &tree["."];
        let mut modules: Vec<String> = root.subdirs.iter().cloned().collect();
        if !root.files.is_empty() {
            modules.insert(0, ".".to_owned());
        }

        let mut histogram: BTreeMap<String, usize> = BTreeMap::new();
        for file in files {
            if let Some(lang) = &file.metadata.language {
                *histogram.entry(lang.clone()).or_default() += 1;
            }
        }
        let mut tech_stack: Vec<(String, usize)> =
            histogram.into_iter().collect();
        tech_stack.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let module_summaries: Vec<String> = modules
            .iter()
            .filter_map(|m| produced.get(m).map(|(_, s)| s.clone()))
            .collect();

        let target = SummaryTarget::Repo {
            repo_id: self.repo_id.clone(),
            language_histogram: tech_stack.clone(),
            top_dirs: modules.clone(),
            module_summaries,
        };
        let summary = self.enricher.summarize(&target).await;
        let embedding = self.embedder.embed_one(&summary.text, TextKind::Document).await?;

        let mut doc = Document::new(DocType::RepoSummary, &self.repo_id, ".", head_commit)
            .with_content(summary.text)
            .with_embedding(embedding);
        debug_assert_eq!(doc.document_id, repo_doc_id);
        doc.children_ids =
            produced.get(".").map(|(id, _)| vec![id.clone()]).unwrap_or_default();
        doc.metadata.total_files = Some(files.len() as u32);
        doc.metadata.modules = Some(modules);
        doc.metadata.tech_stack =
            Some(tech_stack.into_iter().map(|(lang, _)| lang).collect());
        doc.quality = Quality {
            enrichment_level: summary.level,
            llm_available: summary.llm_available,
            summary_source: "pipeline".to_owned(),
            protect_from_update: false,
        };

        if !self.dry_run {
            let previous = self.store.find_one(DocType::RepoSummary, &self.repo_id, None).await?;
            if previous.as_ref().is_some_and(|p| p.document_id != doc.document_id) {
                self.store.delete_by_query(&self.repo_id, DocType::RepoSummary, None).await?;
            }
            self.store.upsert(&doc).await?;
            // A short-circuited root module still has to name the fresh
            // repo summary as its parent.
            self.relink_children(&doc).await?;
        }
        Ok(())
    }
}

/// POSIX directory of a repo-relative path; `.` for the root.
fn dir_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => ".".to_owned(),
    }
}

fn parent_dir(dir: &str) -> Option<String> {
    if dir == "." {
        return None;
    }
    Some(dir.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_else(|| ".".to_owned()))
}

fn depth(dir: &str) -> usize {
    if dir == "." {
        0
    } else {
        dir.matches('/').count() + 1
    }
}

/// Minimal directory tree over the indexed files. Every ancestor of a file's
/// directory is a node; the root `.` is always present.
fn build_tree(files: &[Document]) -> BTreeMap<String, DirNode> {
    let mut tree: BTreeMap<String, DirNode> = BTreeMap::new();
    if files.is_empty() {
        return tree;
    }
    tree.entry(".".to_owned()).or_default();

    for file in files {
        let Some(path) = file.file_path.as_deref() else { continue };
        let dir = dir_of(path);
        tree.entry(dir.clone()).or_default().files.push(file.clone());

        // Register the chain up to the root.
        let mut current = dir;
        while let Some(parent) = parent_dir(&current) {
            tree.entry(parent.clone()).or_default().subdirs.insert(current.clone());
            tree.entry(current.clone()).or_default();
            current = parent;
        }
    }
    tree
}
