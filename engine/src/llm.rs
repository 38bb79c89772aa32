//! LLM enricher
//!
//! Single façade over the text LLM. Transport ([`LlmClient`]) is separated
//! from policy ([`Enricher`]): the enricher owns the strict-JSON contract,
//! retries with backoff, the process-wide circuit breaker, deterministic
//! fallback summaries and the shared token counter. Callers never talk to
//! the LLM service directly and never instantiate their own client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::chunker::{ChunkPrompt, LlmChunk};
use crate::config::LlmProvider;
use crate::error::{IngestError, Result};
use crate::types::{EnrichmentLevel, ErrorRecord};

/// Consecutive failures that trip the breaker OPEN
const BREAKER_OPEN_THRESHOLD: u32 = 5;
/// OPEN duration before a single HALF-OPEN probe is allowed
const BREAKER_RESET: Duration = Duration::from_secs(60);
/// Wall-clock budget for one LLM call
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Attempts per request; backoff between them
const CALL_ATTEMPTS: u32 = 3;
const BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];
const BACKOFF_LAST: Duration = Duration::from_secs(16);

/// Raw completion from the transport
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub tokens: u64,
}

/// Transport seam: one completion call, no policy.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<LlmReply>;
}

/// What is being summarized; carries both the LLM context and the
/// structural metadata the deterministic fallback is built from.
#[derive(Debug, Clone)]
pub enum SummaryTarget {
    Symbol {
        name: String,
        kind: String,
        docstring: Option<String>,
        code: String,
    },
    File {
        path: String,
        language: Option<String>,
        symbol_names: Vec<String>,
        module_docstring: Option<String>,
        symbol_summaries: Vec<String>,
        /// Up to the first 200 lines of the file
        prefix: String,
    },
    Module {
        path: String,
        key_files: Vec<String>,
        child_summaries: Vec<String>,
    },
    Repo {
        repo_id: String,
        language_histogram: Vec<(String, usize)>,
        top_dirs: Vec<String>,
        module_summaries: Vec<String>,
    },
}

/// Result of a summarize call
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub level: EnrichmentLevel,
    pub llm_available: bool,
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Process-wide circuit breaker; the only shared mutable state in the
/// enricher besides the token counter.
struct Breaker {
    state: Mutex<BreakerState>,
    reset: Duration,
}

enum BreakerDecision {
    Allow,
    Deny,
}

impl Breaker {
    fn new(reset: Duration) -> Self {
        Self { state: Mutex::new(BreakerState::Closed { failures: 0 }), reset }
    }

    fn check(&self) -> BreakerDecision {
        let mut state = self.state.lock().unwrap();
        match &*state {
            BreakerState::Closed { .. } => BreakerDecision::Allow,
            BreakerState::Open { since } if since.elapsed() >= self.reset => {
                *state = BreakerState::HalfOpen;
                BreakerDecision::Allow
            }
            BreakerState::Open { .. } => BreakerDecision::Deny,
            // A probe is already in flight; everyone else stays on fallback.
            BreakerState::HalfOpen => BreakerDecision::Deny,
        }
    }

    fn on_success(&self) {
        *self.state.lock().unwrap() = BreakerState::Closed { failures: 0 };
    }

    /// Returns true when this failure tripped the breaker OPEN.
    fn on_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed { failures } => {
                *failures += 1;
                if *failures >= BREAKER_OPEN_THRESHOLD {
                    *state = BreakerState::Open { since: Instant::now() };
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                *state = BreakerState::Open { since: Instant::now() };
                false
            }
            BreakerState::Open { .. } => false,
        }
    }

    fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), BreakerState::Open { .. })
    }
}

/// The enricher façade
pub struct Enricher {
    client: Box<dyn LlmClient>,
    breaker: Breaker,
    tokens: AtomicU64,
    breaker_event: Mutex<Option<ErrorRecord>>,
}

impl Enricher {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self::with_breaker_reset(client, BREAKER_RESET)
    }

    /// Same enricher with a custom OPEN duration; tests shrink it.
    pub fn with_breaker_reset(client: Box<dyn LlmClient>, reset: Duration) -> Self {
        Self {
            client,
            breaker: Breaker::new(reset),
            tokens: AtomicU64::new(0),
            breaker_event: Mutex::new(None),
        }
    }

    /// Prompt+completion tokens spent this run, across all callers.
    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// The one audit entry recorded when the breaker first trips.
    pub fn breaker_event(&self) -> Option<ErrorRecord> {
        self.breaker_event.lock().unwrap().clone()
    }

    pub fn llm_available(&self) -> bool {
        !self.breaker.is_open()
    }

    /// Summarize a target. Never errors: degraded conditions produce the
    /// deterministic fallback with `enrichment_level = basic`.
    pub async fn summarize(&self, target: &SummaryTarget) -> Summary {
        if matches!(self.breaker.check(), BreakerDecision::Deny) {
            return Summary {
                text: fallback_summary(target),
                level: EnrichmentLevel::Basic,
                llm_available: false,
            };
        }

        let prompt = summary_prompt(target);
        match self.call_validated(&prompt, |text| parse_summary_reply(text)).await {
            Ok(text) => {
                let level = match target {
                    SummaryTarget::Symbol { .. } => EnrichmentLevel::LlmFull,
                    _ => EnrichmentLevel::LlmSummary,
                };
                Summary { text, level, llm_available: true }
            }
            Err(e) => {
                log::warn!("llm summary failed ({}); using fallback", e.class());
                Summary {
                    text: fallback_summary(target),
                    level: EnrichmentLevel::Basic,
                    llm_available: false,
                }
            }
        }
    }

    /// Ask the chunking prompt for semantic chunks. Empty when the LLM is
    /// unavailable; the caller merges whatever comes back.
    pub async fn propose_chunks(
        &self,
        prompt_kind: ChunkPrompt,
        path: &str,
        source: &str,
    ) -> Vec<LlmChunk> {
        if matches!(self.breaker.check(), BreakerDecision::Deny) {
            return Vec::new();
        }

        let prompt = chunk_prompt(prompt_kind, path, source);
        match self.call_validated(&prompt, |text| parse_chunk_reply(text)).await {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("llm chunking failed for {path} ({})", e.class());
                Vec::new()
            }
        }
    }

    /// One validated request: transient failures retry with backoff, a
    /// non-conforming reply gets a single reinforced retry, 4xx never
    /// retries. Every outcome feeds the breaker.
    async fn call_validated<T, F>(&self, prompt: &str, parse: F) -> Result<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        let mut reinforced = false;
        let mut prompt = prompt.to_owned();
        let mut attempt = 0;

        loop {
            match self.call_once(&prompt).await {
                Ok(reply) => {
                    if let Some(parsed) = parse(&reply.text) {
                        self.breaker.on_success();
                        return Ok(parsed);
                    }
                    if !reinforced {
                        reinforced = true;
                        prompt = format!(
                            "{prompt}\n\nYour previous reply was not valid JSON matching the \
                             schema. Reply with ONLY the JSON, no prose, no code fences."
                        );
                        continue;
                    }
                    self.note_failure("llm reply failed schema validation twice");
                    return Err(IngestError::operation("llm", "reply failed validation"));
                }
                Err(e) if e.is_transient() && attempt + 1 < CALL_ATTEMPTS => {
                    self.note_failure(&e.to_string());
                    let backoff =
                        BACKOFF.get(attempt as usize).copied().unwrap_or(BACKOFF_LAST);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.note_failure(&e.to_string());
                    return Err(e.into_operation());
                }
            }
        }
    }

    async fn call_once(&self, prompt: &str) -> Result<LlmReply> {
        let reply = tokio::time::timeout(CALL_TIMEOUT, self.client.complete(prompt))
            .await
            .map_err(|_| IngestError::transient("llm", "call timed out"))??;
        self.tokens.fetch_add(reply.tokens, Ordering::Relaxed);
        Ok(reply)
    }

    fn note_failure(&self, message: &str) {
        if self.breaker.on_failure() {
            log::warn!("llm circuit breaker OPEN after {BREAKER_OPEN_THRESHOLD} failures");
            let mut event = self.breaker_event.lock().unwrap();
            if event.is_none() {
                *event = Some(ErrorRecord {
                    scope: "llm".to_owned(),
                    kind: "policy".to_owned(),
                    message: format!(
                        "circuit breaker opened after {BREAKER_OPEN_THRESHOLD} consecutive failures: {message}"
                    ),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts and reply validation
// ---------------------------------------------------------------------------

const SUMMARY_SCHEMA: &str = r#"{"summary": "<one concise paragraph>"}"#;

fn summary_prompt(target: &SummaryTarget) -> String {
    let (role, context) = match target {
        SummaryTarget::Symbol { name, kind, docstring, code } => (
            format!("Summarize what the {kind} `{name}` does."),
            format!(
                "Docstring: {}\n\nCode:\n{}",
                docstring.as_deref().unwrap_or("(none)"),
                code
            ),
        ),
        SummaryTarget::File { path, language, symbol_summaries, prefix, .. } => (
            format!(
                "Summarize the purpose of the {} file `{path}`.",
                language.as_deref().unwrap_or("source")
            ),
            format!(
                "Symbol summaries:\n{}\n\nFile prefix:\n{}",
                bulleted(symbol_summaries),
                prefix
            ),
        ),
        SummaryTarget::Module { path, child_summaries, .. } => (
            format!("Summarize the module (directory) `{path}` from its contents."),
            format!("Child summaries:\n{}", bulleted(child_summaries)),
        ),
        SummaryTarget::Repo { repo_id, module_summaries, .. } => (
            format!("Summarize the repository `{repo_id}` from its module summaries."),
            format!("Module summaries:\n{}", bulleted(module_summaries)),
        ),
    };
    format!("{role}\n\n{context}\n\nReply with flat JSON exactly matching: {SUMMARY_SCHEMA}")
}

fn chunk_prompt(kind: ChunkPrompt, path: &str, source: &str) -> String {
    format!(
        "{}\n\nFile: {path}\n\n{source}\n\nReply with a flat JSON array; each element: \
         {{\"name\": str, \"kind\": str, \"start_line\": int, \"end_line\": int, \
         \"tags\": [str], \"confidence\": float between 0 and 1}}",
        kind.instruction()
    )
}

fn bulleted(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_owned();
    }
    items.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n")
}

/// Strip optional code fences and locate the JSON payload.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn parse_summary_reply(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(extract_json(text)).ok()?;
    let summary = value.get("summary")?.as_str()?.trim();
    if summary.is_empty() {
        return None;
    }
    Some(summary.to_owned())
}

fn parse_chunk_reply(text: &str) -> Option<Vec<LlmChunk>> {
    serde_json::from_str::<Vec<LlmChunk>>(extract_json(text)).ok()
}

// ---------------------------------------------------------------------------
// Deterministic fallbacks
// ---------------------------------------------------------------------------

fn first_sentence(text: &str) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flattened.find(". ") {
        Some(idx) => flattened[..=idx].to_owned(),
        None => flattened,
    }
}

/// Summary built from structural metadata alone, for when the LLM is out.
pub fn fallback_summary(target: &SummaryTarget) -> String {
    match target {
        SummaryTarget::Symbol { name, kind, docstring, .. } => match docstring {
            Some(doc) if !doc.trim().is_empty() => {
                format!("{kind} {name}: {}", first_sentence(doc))
            }
            _ => format!("{kind} {name}"),
        },
        SummaryTarget::File { path, symbol_names, module_docstring, .. } => {
            let mut parts = vec![format!("File {path}")];
            if !symbol_names.is_empty() {
                parts.push(format!("defines {}", symbol_names.join(", ")));
            }
            if let Some(doc) = module_docstring {
                if !doc.trim().is_empty() {
                    parts.push(first_sentence(doc));
                }
            }
            parts.join(". ")
        }
        SummaryTarget::Module { path, key_files, .. } => {
            if key_files.is_empty() {
                format!("Module {path}")
            } else {
                format!("Module {path} containing {}", key_files.join(", "))
            }
        }
        SummaryTarget::Repo { repo_id, language_histogram, top_dirs, .. } => {
            let langs: Vec<String> = language_histogram
                .iter()
                .map(|(lang, count)| format!("{lang} ({count})"))
                .collect();
            let mut out = format!("Repository {repo_id}");
            if !langs.is_empty() {
                out.push_str(&format!(". Languages: {}", langs.join(", ")));
            }
            if !top_dirs.is_empty() {
                out.push_str(&format!(". Top-level directories: {}", top_dirs.join(", ")));
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// reqwest-backed transport for both provider protocols
pub struct HttpLlm {
    client: reqwest::Client,
    provider: LlmProvider,
    endpoint: String,
    model: String,
}

impl HttpLlm {
    pub fn new(
        provider: LlmProvider,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Fatal(format!("llm client: {e}")))?;
        Ok(Self {
            client,
            provider,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn complete(&self, prompt: &str) -> Result<LlmReply> {
        let context = "llm complete";

        let (url, body) = match self.provider {
            LlmProvider::Local => (
                format!("{}/api/generate", self.endpoint),
                json!({ "model": self.model, "prompt": prompt, "stream": false }),
            ),
            LlmProvider::Remote => (
                format!("{}/v1/chat/completions", self.endpoint),
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": 0.2,
                }),
            ),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| IngestError::transient(context, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IngestError::transient(context, status));
        }
        if !status.is_success() {
            // 4xx is a contract problem; retrying will not help.
            return Err(IngestError::operation(context, status));
        }

        let value: serde_json::Value =
            response.json().await.map_err(|e| IngestError::operation(context, e))?;

        match self.provider {
            LlmProvider::Local => {
                let text = value
                    .get("response")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| IngestError::operation(context, "missing response field"))?
                    .to_owned();
                let tokens = value.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0)
                    + value.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(LlmReply { text, tokens })
            }
            LlmProvider::Remote => {
                let text = value
                    .pointer("/choices/0/message/content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| IngestError::operation(context, "missing completion"))?
                    .to_owned();
                let tokens =
                    value.pointer("/usage/total_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(LlmReply { text, tokens })
            }
        }
    }
}
