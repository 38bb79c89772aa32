//! Embedding engine
//!
//! One seam, two modes. The local encoder is configured to L2-normalize its
//! own output; the remote mode normalizes in-engine. Either way a vector
//! leaves this module only at unit length and the configured dimensionality,
//! and the store re-checks both at write time.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::EmbeddingMode;
use crate::error::{IngestError, Result};

/// Allowed deviation of `‖v‖₂` from 1.0
pub const NORM_TOLERANCE: f32 = 1.0e-3;

/// Prefix applied before encoding, by text role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    /// Corpus content: `search_document: `
    Document,
    /// Query text: `search_query: `
    Query,
}

impl TextKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Document => "search_document: ",
            Self::Query => "search_query: ",
        }
    }

    pub fn apply(&self, text: &str) -> String {
        format!("{}{}", self.prefix(), text)
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale to unit length. A zero vector cannot be normalized and is reported
/// as an operation failure by callers.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

pub fn is_unit(v: &[f32]) -> bool {
    (l2_norm(v) - 1.0).abs() <= NORM_TOLERANCE
}

/// Embedding seam; returns one unit vector per input text.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    async fn embed(&self, texts: &[String], kind: TextKind) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str, kind: TextKind) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_owned()], kind).await?;
        vectors
            .pop()
            .ok_or_else(|| IngestError::operation("embed", "encoder returned no vector"))
    }
}

/// HTTP-backed encoder (TEI-style `POST /embed` with an `inputs` array)
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    mode: EmbeddingMode,
    dim: usize,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        mode: EmbeddingMode,
        dim: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| IngestError::Fatal(format!("embedding client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            mode,
            dim,
            batch_size: batch_size.max(1),
        })
    }

    async fn fetch_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let context = format!("embed batch of {}", inputs.len());
        let response = self
            .client
            .post(format!("{}/embed", self.endpoint))
            .json(&json!({ "inputs": inputs }))
            .send()
            .await
            .map_err(|e| IngestError::transient(context.clone(), e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IngestError::transient(context, status));
        }
        if !status.is_success() {
            return Err(IngestError::operation(context, status));
        }
        response
            .json::<Vec<Vec<f32>>>()
            .await
            .map_err(|e| IngestError::operation(context, e))
    }

    /// Bring a raw batch up to the unit-norm contract, or say why not.
    fn condition(&self, vectors: &mut [Vec<f32>]) -> std::result::Result<(), String> {
        for v in vectors.iter_mut() {
            if v.len() != self.dim {
                return Err(format!("encoder returned {} dims, expected {}", v.len(), self.dim));
            }
            match self.mode {
                EmbeddingMode::Remote => {
                    if !normalize(v) {
                        return Err("encoder returned a zero vector".to_owned());
                    }
                }
                EmbeddingMode::Local => {
                    // The encoder normalizes; verify rather than re-scale.
                    if !is_unit(v) {
                        return Err(format!("local encoder norm {} outside tolerance", l2_norm(v)));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String], kind: TextKind) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|t| kind.apply(t)).collect();

            let mut vectors = self.fetch_batch(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(IngestError::operation(
                    "embed",
                    format!("encoder returned {} vectors for {} inputs", vectors.len(), inputs.len()),
                ));
            }

            if let Err(first_reason) = self.condition(&mut vectors) {
                // One retry on a norm/dim violation, then fail.
                log::warn!("embedding batch violated contract ({first_reason}); retrying once");
                vectors = self.fetch_batch(&inputs).await?;
                self.condition(&mut vectors)
                    .map_err(|reason| IngestError::operation("embed", reason))?;
            }

            out.extend(vectors);
        }

        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert_eq!(TextKind::Document.apply("fn main"), "search_document: fn main");
        assert_eq!(TextKind::Query.apply("auth flow"), "search_query: auth flow");
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        assert!(!normalize(&mut zero));
    }

    #[test]
    fn test_is_unit_tolerance() {
        assert!(is_unit(&[1.0, 0.0]));
        assert!(is_unit(&[1.0005, 0.0]));
        assert!(!is_unit(&[1.01, 0.0]));
        assert!(!is_unit(&[0.5, 0.0]));
    }

    #[test]
    fn test_condition_remote_normalizes() {
        let embedder =
            HttpEmbedder::new("http://localhost:8080", EmbeddingMode::Remote, 2, 128).unwrap();
        let mut vectors = vec![vec![3.0, 4.0]];
        embedder.condition(&mut vectors).unwrap();
        assert!(is_unit(&vectors[0]));
    }

    #[test]
    fn test_condition_local_verifies_without_rescaling() {
        let embedder =
            HttpEmbedder::new("http://localhost:8080", EmbeddingMode::Local, 2, 128).unwrap();
        let mut ok = vec![vec![0.6, 0.8]];
        assert!(embedder.condition(&mut ok).is_ok());

        let mut bad = vec![vec![3.0, 4.0]];
        assert!(embedder.condition(&mut bad).is_err());
    }

    #[test]
    fn test_condition_checks_dimensionality() {
        let embedder =
            HttpEmbedder::new("http://localhost:8080", EmbeddingMode::Remote, 3, 128).unwrap();
        let mut wrong = vec![vec![1.0, 0.0]];
        assert!(embedder.condition(&mut wrong).is_err());
    }
}
