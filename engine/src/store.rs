//! Document store adapter
//!
//! The index lives in an external schema-less document database with
//! full-text and k-NN search configured out-of-band. The pipeline needs only
//! key-value upsert/get/delete, a small query surface (typed deletes, counts,
//! distinct repo ids), a bulk endpoint and a diagnostic vector search.
//!
//! [`DocumentStore`] is the seam; production talks REST through
//! [`HttpDocumentStore`], tests use [`MemoryDocumentStore`]. Upsert is the
//! single write path: a document whose embedding is missing, mis-sized or
//! non-unit never reaches the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::embed::{l2_norm, NORM_TOLERANCE};
use crate::error::{IngestError, Result};
use crate::types::{DocType, Document};

/// Attempts for idempotent upsert retries on transient failures
const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_BACKOFF: Duration = Duration::from_millis(500);

/// Store operations required by the pipeline
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotent write; retried internally on transient failures.
    async fn upsert(&self, doc: &Document) -> Result<()>;

    /// `None` is a normal signal, not an error.
    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Delete documents of one type in a repo, optionally narrowed to a file
    /// path. Returns the number deleted.
    async fn delete_by_query(
        &self,
        repo_id: &str,
        doc_type: DocType,
        file_path: Option<&str>,
    ) -> Result<u64>;

    async fn count_by(&self, doc_type: DocType, repo_id: Option<&str>) -> Result<u64>;

    /// Repo ids that currently have a document of this type (the reconciler
    /// derives the indexed set from `repo_summary`).
    async fn distinct_repo_ids(&self, doc_type: DocType) -> Result<Vec<String>>;

    /// Every document of one type; used by maintenance passes and the
    /// stale-run sweep.
    async fn list_by_type(&self, doc_type: DocType) -> Result<Vec<Document>>;

    /// Every document of one type in one repo; the aggregator reads the
    /// current file generation through this.
    async fn list_by_repo(&self, doc_type: DocType, repo_id: &str) -> Result<Vec<Document>>;

    /// The current document of one type in a repo, optionally narrowed to a
    /// file or module path. This is how incremental runs find the previous
    /// generation of a document whose commit (and therefore id) is unknown.
    async fn find_one(
        &self,
        doc_type: DocType,
        repo_id: &str,
        path: Option<&str>,
    ) -> Result<Option<Document>>;

    /// Diagnostic k-NN over stored embeddings; ranked `(id, score)`.
    async fn search(
        &self,
        repo_id: &str,
        doc_type: DocType,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>>;

    /// Bulk write; same validation as `upsert`.
    async fn upsert_bulk(&self, docs: &[Document]) -> Result<()> {
        for doc in docs {
            self.upsert(doc).await?;
        }
        Ok(())
    }

    /// Startup reachability check; failure is fatal before any repo work.
    async fn ping(&self) -> Result<()>;
}

/// Reject writes that violate the embedding invariants.
pub fn validate_for_write(doc: &Document, dim: usize) -> Result<()> {
    if doc.doc_type.requires_embedding() {
        if doc.embedding.len() != dim {
            return Err(IngestError::operation(
                format!("upsert {}", doc.document_id),
                format!("embedding has {} dims, store expects {dim}", doc.embedding.len()),
            ));
        }
        let norm = l2_norm(&doc.embedding);
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(IngestError::operation(
                format!("upsert {}", doc.document_id),
                format!("embedding norm {norm} outside unit tolerance"),
            ));
        }
    } else if !doc.embedding.is_empty() {
        return Err(IngestError::operation(
            format!("upsert {}", doc.document_id),
            "audit documents must not carry an embedding",
        ));
    }
    Ok(())
}

/// Re-normalize stored embeddings in place. Documents already inside the
/// unit tolerance are skipped; zero vectors are reported and left alone.
/// Returns `(fixed, skipped)`.
pub async fn normalize_embeddings(store: &dyn DocumentStore, dry_run: bool) -> Result<(u64, u64)> {
    let mut fixed = 0;
    let mut skipped = 0;

    for doc_type in DocType::indexed() {
        for mut doc in store.list_by_type(doc_type).await? {
            if crate::embed::is_unit(&doc.embedding) {
                skipped += 1;
                continue;
            }
            if !crate::embed::normalize(&mut doc.embedding) {
                log::warn!("{}: zero-length embedding, cannot normalize", doc.document_id);
                skipped += 1;
                continue;
            }
            if dry_run {
                log::info!("{}: would re-normalize", doc.document_id);
            } else {
                store.upsert(&doc).await?;
            }
            fixed += 1;
        }
    }
    Ok((fixed, skipped))
}

// ---------------------------------------------------------------------------
// In-memory store (tests, dry runs)
// ---------------------------------------------------------------------------

/// HashMap-backed store with the same validation as the REST adapter.
pub struct MemoryDocumentStore {
    dim: usize,
    docs: Mutex<HashMap<String, Document>>,
    writes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new(dim: usize) -> Self {
        Self { dim, docs: Mutex::new(HashMap::new()), writes: AtomicU64::new(0) }
    }

    /// Total accepted writes; lets tests assert zero-write incrementality.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Bypass write validation, standing in for documents persisted by an
    /// older pipeline before the norm gate existed.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, doc: Document) {
        self.docs.lock().unwrap().insert(doc.document_id.clone(), doc);
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, doc: &Document) -> Result<()> {
        validate_for_write(doc, self.dim)?;
        self.docs.lock().unwrap().insert(doc.document_id.clone(), doc.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.lock().unwrap().get(id).cloned())
    }

    async fn delete_by_query(
        &self,
        repo_id: &str,
        doc_type: DocType,
        file_path: Option<&str>,
    ) -> Result<u64> {
        let mut docs = self.docs.lock().unwrap();
        let before = docs.len();
        docs.retain(|_, d| {
            let matches = d.repo_id == repo_id
                && d.doc_type == doc_type
                && file_path.is_none_or(|p| {
                    d.file_path.as_deref() == Some(p) || d.module_path.as_deref() == Some(p)
                });
            !matches
        });
        Ok((before - docs.len()) as u64)
    }

    async fn count_by(&self, doc_type: DocType, repo_id: Option<&str>) -> Result<u64> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .values()
            .filter(|d| d.doc_type == doc_type && repo_id.is_none_or(|r| d.repo_id == r))
            .count() as u64)
    }

    async fn distinct_repo_ids(&self, doc_type: DocType) -> Result<Vec<String>> {
        let docs = self.docs.lock().unwrap();
        let mut ids: Vec<String> = docs
            .values()
            .filter(|d| d.doc_type == doc_type)
            .map(|d| d.repo_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn list_by_type(&self, doc_type: DocType) -> Result<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut out: Vec<Document> =
            docs.values().filter(|d| d.doc_type == doc_type).cloned().collect();
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(out)
    }

    async fn list_by_repo(&self, doc_type: DocType, repo_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| d.doc_type == doc_type && d.repo_id == repo_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(out)
    }

    async fn find_one(
        &self,
        doc_type: DocType,
        repo_id: &str,
        path: Option<&str>,
    ) -> Result<Option<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut matches: Vec<&Document> = docs
            .values()
            .filter(|d| {
                d.doc_type == doc_type
                    && d.repo_id == repo_id
                    && path.is_none_or(|p| {
                        d.file_path.as_deref() == Some(p) || d.module_path.as_deref() == Some(p)
                    })
            })
            .collect();
        matches.sort_by(|a, b| b.version.created_at.cmp(&a.version.created_at));
        Ok(matches.first().map(|d| (*d).clone()))
    }

    async fn search(
        &self,
        repo_id: &str,
        doc_type: DocType,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let docs = self.docs.lock().unwrap();
        let mut scored: Vec<(String, f32)> = docs
            .values()
            .filter(|d| d.repo_id == repo_id && d.doc_type == doc_type)
            .map(|d| {
                // Stored vectors are unit length, so dot product is cosine.
                let score = d.embedding.iter().zip(vector).map(|(a, b)| a * b).sum();
                (d.document_id.clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// REST adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

/// REST adapter for the external document database
pub struct HttpDocumentStore {
    client: reqwest::Client,
    host: String,
    bucket: String,
    user: String,
    password: String,
    dim: usize,
}

impl HttpDocumentStore {
    pub fn new(
        host: impl Into<String>,
        bucket: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        dim: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Fatal(format!("document store client: {e}")))?;
        Ok(Self {
            client,
            host: host.into().trim_end_matches('/').to_owned(),
            bucket: bucket.into(),
            user: user.into(),
            password: password.into(),
            dim,
        })
    }

    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}/docs/{id}", self.host, self.bucket)
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/{}/{op}", self.host, self.bucket)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.user, Some(&self.password))
    }

    /// Map an HTTP outcome onto the error taxonomy: 5xx and wire failures
    /// are transient, anything else 4xx is an operation error.
    async fn check(
        context: &str,
        result: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response> {
        let response = result.map_err(|e| IngestError::transient(context.to_owned(), e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(IngestError::transient(context.to_owned(), status));
        }
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(IngestError::operation(context.to_owned(), status));
        }
        Ok(response)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn upsert(&self, doc: &Document) -> Result<()> {
        validate_for_write(doc, self.dim)?;
        let context = format!("store upsert {}", doc.document_id);

        let mut last_err = None;
        for attempt in 0..UPSERT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(UPSERT_BACKOFF * attempt).await;
            }
            let result = self
                .auth(self.client.put(self.doc_url(&doc.document_id)))
                .json(doc)
                .send()
                .await;
            match Self::check(&context, result).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .map(IngestError::into_operation)
            .unwrap_or_else(|| IngestError::operation(context, "upsert retries exhausted")))
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let context = format!("store get {id}");
        let result = self.auth(self.client.get(self.doc_url(id))).send().await;
        let response = Self::check(&context, result).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc = response
            .json::<Document>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(Some(doc))
    }

    async fn delete_by_query(
        &self,
        repo_id: &str,
        doc_type: DocType,
        file_path: Option<&str>,
    ) -> Result<u64> {
        let context = format!("store delete {} {repo_id}", doc_type.name());
        let mut body = json!({
            "action": "delete",
            "type": doc_type.name(),
            "repo_id": repo_id,
        });
        if let Some(path) = file_path {
            body["file_path"] = json!(path);
        }
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let counted = response
            .json::<CountResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(counted.count)
    }

    async fn count_by(&self, doc_type: DocType, repo_id: Option<&str>) -> Result<u64> {
        let context = format!("store count {}", doc_type.name());
        let mut body = json!({ "action": "count", "type": doc_type.name() });
        if let Some(repo) = repo_id {
            body["repo_id"] = json!(repo);
        }
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let counted = response
            .json::<CountResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(counted.count)
    }

    async fn distinct_repo_ids(&self, doc_type: DocType) -> Result<Vec<String>> {
        let context = format!("store distinct {}", doc_type.name());
        let body = json!({ "action": "distinct", "field": "repo_id", "type": doc_type.name() });
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let values = response
            .json::<ValuesResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(values.values)
    }

    async fn list_by_type(&self, doc_type: DocType) -> Result<Vec<Document>> {
        let context = format!("store list {}", doc_type.name());
        let body = json!({ "action": "select", "type": doc_type.name() });
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let docs = response
            .json::<DocumentsResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(docs.documents)
    }

    async fn list_by_repo(&self, doc_type: DocType, repo_id: &str) -> Result<Vec<Document>> {
        let context = format!("store list {} {repo_id}", doc_type.name());
        let body = json!({ "action": "select", "type": doc_type.name(), "repo_id": repo_id });
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let docs = response
            .json::<DocumentsResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(docs.documents)
    }

    async fn find_one(
        &self,
        doc_type: DocType,
        repo_id: &str,
        path: Option<&str>,
    ) -> Result<Option<Document>> {
        let context = format!("store find_one {}", doc_type.name());
        let mut body = json!({
            "action": "select_one",
            "type": doc_type.name(),
            "repo_id": repo_id,
        });
        if let Some(path) = path {
            body["path"] = json!(path);
        }
        let result = self.auth(self.client.post(self.endpoint("query"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let docs = response
            .json::<DocumentsResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(docs.documents.into_iter().next())
    }

    async fn search(
        &self,
        repo_id: &str,
        doc_type: DocType,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let context = format!("store search {}", doc_type.name());
        let body = json!({
            "repo_id": repo_id,
            "type": doc_type.name(),
            "vector": vector,
            "k": k,
        });
        let result = self.auth(self.client.post(self.endpoint("search"))).json(&body).send().await;
        let response = Self::check(&context, result).await?;
        let hits = response
            .json::<SearchResponse>()
            .await
            .map_err(|e| IngestError::operation(context, e))?;
        Ok(hits.hits.into_iter().map(|h| (h.id, h.score)).collect())
    }

    async fn upsert_bulk(&self, docs: &[Document]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        for doc in docs {
            validate_for_write(doc, self.dim)?;
        }
        let context = format!("store bulk upsert ({} docs)", docs.len());
        let result = self.auth(self.client.post(self.endpoint("bulk"))).json(docs).send().await;
        Self::check(&context, result).await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let context = "store ping";
        let result = self.auth(self.client.get(self.endpoint("ping"))).send().await;
        match Self::check(context, result).await {
            Ok(_) => Ok(()),
            Err(e) => Err(IngestError::Fatal(format!("document store unreachable: {e}"))),
        }
    }
}
