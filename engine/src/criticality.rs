//! Dependency graph and module criticality
//!
//! Optional post-pass: build a directed import graph over the repo's
//! modules and run PageRank; the per-module score lands on the matching
//! `module_summary` as `criticality_score`. Strictly additive — failures
//! here never block the main pipeline.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::Result;
use crate::store::DocumentStore;
use crate::types::DocType;

/// PageRank damping factor
const DAMPING: f64 = 0.85;
/// Convergence threshold on the L1 change between iterations
const EPSILON: f64 = 1.0e-6;
/// Iteration cap when convergence stalls
const MAX_ITERATIONS: usize = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct CriticalityStats {
    pub modules_scored: u64,
    pub edges: usize,
}

/// Score one repository's modules and store the results.
pub async fn backfill_repo(store: &dyn DocumentStore, repo_id: &str) -> Result<CriticalityStats> {
    let modules = store.list_by_repo(DocType::ModuleSummary, repo_id).await?;
    if modules.is_empty() {
        return Ok(CriticalityStats::default());
    }

    let module_dirs: BTreeSet<String> =
        modules.iter().filter_map(|m| m.module_path.clone()).collect();

    // Edges: the directory of each file imports the module its import
    // statement resolves to. Unresolvable imports are dropped, not guessed.
    let files = store.list_by_repo(DocType::FileIndex, repo_id).await?;
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: BTreeMap<String, NodeIndex> = BTreeMap::new();
    for dir in &module_dirs {
        nodes.insert(dir.clone(), graph.add_node(dir.clone()));
    }

    let mut edge_set: BTreeSet<(String, String)> = BTreeSet::new();
    for file in &files {
        let Some(path) = file.file_path.as_deref() else { continue };
        let from_dir = dir_of(path);
        let Some(imports) = &file.metadata.imports else { continue };
        for import in imports {
            if let Some(target) = resolve_import(import, &from_dir, &module_dirs) {
                if target != from_dir {
                    edge_set.insert((from_dir.clone(), target));
                }
            }
        }
    }
    for (from, to) in &edge_set {
        if let (Some(&a), Some(&b)) = (nodes.get(from), nodes.get(to)) {
            graph.add_edge(a, b, ());
        }
    }

    let ranks = pagerank(&graph);

    let mut stats = CriticalityStats { modules_scored: 0, edges: graph.edge_count() };
    for mut module in modules {
        let Some(path) = module.module_path.clone() else { continue };
        let Some(&idx) = nodes.get(&path) else { continue };
        let score = ranks.get(&idx).copied().unwrap_or(0.0);
        if module.criticality_score != Some(score) {
            module.criticality_score = Some(score);
            store.upsert(&module).await?;
        }
        stats.modules_scored += 1;
    }

    if log::log_enabled!(log::Level::Debug) {
        let mut ranked: Vec<(&String, f64)> = nodes
            .iter()
            .map(|(path, idx)| (path, ranks.get(idx).copied().unwrap_or(0.0)))
            .collect();
        // Lexicographic path breaks score ties deterministically.
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0))
        });
        for (path, score) in ranked.iter().take(10) {
            log::debug!("{repo_id}: criticality {score:.6} {path}");
        }
    }

    Ok(stats)
}

/// Score every repository that has module summaries.
pub async fn backfill_all(store: &dyn DocumentStore) -> Result<CriticalityStats> {
    let mut total = CriticalityStats::default();
    for repo_id in store.distinct_repo_ids(DocType::ModuleSummary).await? {
        let stats = backfill_repo(store, &repo_id).await?;
        total.modules_scored += stats.modules_scored;
        total.edges += stats.edges;
    }
    Ok(total)
}

/// Iterative PageRank with uniform teleport and dangling-mass
/// redistribution, run to convergence or the iteration cap.
fn pagerank(graph: &DiGraph<String, ()>) -> HashMap<NodeIndex, f64> {
    let node_count = graph.node_count();
    if node_count == 0 {
        return HashMap::new();
    }

    let initial = 1.0 / node_count as f64;
    let mut ranks: Vec<f64> = vec![initial; node_count];
    let mut next: Vec<f64> = vec![0.0; node_count];

    for _ in 0..MAX_ITERATIONS {
        let teleport = (1.0 - DAMPING) / node_count as f64;
        next.fill(teleport);

        let mut dangling = 0.0;
        for idx in graph.node_indices() {
            if graph.neighbors(idx).count() == 0 {
                dangling += ranks[idx.index()];
            }
        }
        let dangling_share = DAMPING * dangling / node_count as f64;
        for rank in &mut next {
            *rank += dangling_share;
        }

        for idx in graph.node_indices() {
            let out_degree = graph.neighbors(idx).count();
            if out_degree > 0 {
                let share = DAMPING * ranks[idx.index()] / out_degree as f64;
                for neighbor in graph.neighbors(idx) {
                    next[neighbor.index()] += share;
                }
            }
        }

        let delta: f64 =
            ranks.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        std::mem::swap(&mut ranks, &mut next);
        if delta < EPSILON {
            break;
        }
    }

    graph.node_indices().map(|idx| (idx, ranks[idx.index()])).collect()
}

fn dir_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => ".".to_owned(),
    }
}

/// Map an import statement onto a module directory of this repo.
///
/// Dotted and `::` paths become slashes; relative specifiers resolve
/// against the importing file's directory; the result walks up until it
/// hits a known module. Imports whose first segment is foreign to the repo
/// (standard libraries, third-party packages) resolve to nothing.
fn resolve_import(
    import: &str,
    from_dir: &str,
    module_dirs: &BTreeSet<String>,
) -> Option<String> {
    let trimmed = import.trim();

    // Relative specifiers resolve against the importing file's directory
    // before any separator normalization touches the leading dots.
    let candidate = if let Some(rest) = trimmed.strip_prefix("./") {
        join_dir(from_dir, &rest.replace("::", "/"))
    } else if trimmed.starts_with("../") {
        let mut base = from_dir.to_owned();
        let mut rest = trimmed;
        while let Some(up) = rest.strip_prefix("../") {
            base = match base.rsplit_once('/') {
                Some((parent, _)) => parent.to_owned(),
                None => ".".to_owned(),
            };
            rest = up;
        }
        join_dir(&base, &rest.replace("::", "/"))
    } else {
        trimmed.replace("::", "/").replace('.', "/")
    };

    let candidate = candidate.trim_matches('/').to_owned();
    if candidate.is_empty() {
        return None;
    }

    // Foreign roots do not belong in the graph.
    let first = candidate.split('/').next().unwrap_or(&candidate);
    let first_known =
        module_dirs.contains(first) || module_dirs.contains(&candidate);
    if !first_known {
        return None;
    }

    // Longest known prefix wins: "a/b/c" matches module "a/b" when "a/b/c"
    // names a file rather than a directory.
    let mut probe = candidate;
    loop {
        if module_dirs.contains(&probe) {
            return Some(probe);
        }
        match probe.rsplit_once('/') {
            Some((parent, _)) => probe = parent.to_owned(),
            None => return None,
        }
    }
}

fn join_dir(base: &str, rest: &str) -> String {
    if base == "." {
        rest.to_owned()
    } else if rest.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{rest}")
    }
}
