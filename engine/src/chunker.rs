//! Under-chunking detection and LLM-proposed semantic chunks
//!
//! Structural parsing misses content that lives inside strings: SQL built by
//! f-strings, HTML templates, GraphQL documents, here-docs. Files where that
//! is likely get flagged, and an optional LLM pass proposes additional
//! chunks that materialize as `symbol_index` documents with an
//! `embedded:<kind>` symbol type.

use regex::Regex;
use serde::Deserialize;

use crate::types::ParsedSymbol;

/// Chunk proposals below this confidence are discarded.
pub const MIN_CHUNK_CONFIDENCE: f32 = 0.7;

/// Why a file was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderChunkReason {
    /// Large file with at most one parsed symbol
    LargeWithFewSymbols,
    /// Symbols exist but each covers a suspicious number of lines
    SparseSymbols,
    /// Embedded-content pattern matched (SQL, markup, GraphQL, here-doc)
    EmbeddedContent,
    /// Many string-formatting calls, the classic SQL-by-f-string tell
    FormatCalls,
    /// Service/handler/controller/view/router path with almost no symbols
    HotPath,
}

/// The three chunking prompts; a fixed enumerated set, not a free-form bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPrompt {
    EmbeddedCode,
    BusinessLogic,
    ApiContracts,
}

impl ChunkPrompt {
    /// Which prompt fits the detector's finding
    pub fn for_reason(reason: UnderChunkReason) -> Self {
        match reason {
            UnderChunkReason::EmbeddedContent | UnderChunkReason::FormatCalls => Self::EmbeddedCode,
            UnderChunkReason::LargeWithFewSymbols | UnderChunkReason::SparseSymbols => {
                Self::BusinessLogic
            }
            UnderChunkReason::HotPath => Self::ApiContracts,
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Self::EmbeddedCode => {
                "Identify content embedded inside string literals (SQL statements, \
                 HTML/JSX templates, GraphQL documents, shell scripts) that a \
                 structural parser cannot see. Name each piece after what it does."
            }
            Self::BusinessLogic => {
                "Identify the distinct units of business logic in this file. Large \
                 functions often contain several; split them at natural boundaries."
            }
            Self::ApiContracts => {
                "Identify the API operations this file exposes: routes, handlers, \
                 request/response contracts. One chunk per operation."
            }
        }
    }
}

/// One chunk proposed by the LLM
#[derive(Debug, Clone, Deserialize)]
pub struct LlmChunk {
    pub name: String,
    /// e.g. `sql`, `html`, `graphql`, `logic`, `route`
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f32,
}

/// Configurable detector thresholds
#[derive(Debug, Clone, Copy)]
pub struct UnderChunkThresholds {
    pub min_bytes: u64,
    pub max_lines_per_symbol: u32,
    pub format_calls: usize,
}

impl Default for UnderChunkThresholds {
    fn default() -> Self {
        Self { min_bytes: 5_000, max_lines_per_symbol: 100, format_calls: 5 }
    }
}

/// Heuristic under-chunk detector; compile the regexes once, share freely.
pub struct UnderChunkDetector {
    thresholds: UnderChunkThresholds,
    embedded: Vec<Regex>,
    format_call: Regex,
    hot_path: Regex,
}

impl UnderChunkDetector {
    pub fn new(thresholds: UnderChunkThresholds) -> Self {
        let embedded = [
            // SQL keywords inside the file body
            r"(?is)(select\s+.{1,200}?\s+from\s|insert\s+into\s|update\s+\w+\s+set\s|delete\s+from\s)",
            // Markup closed inside string literals
            r"</[a-zA-Z][a-zA-Z0-9]*>",
            // GraphQL operations or tagged templates
            r#"(?m)(\bgql`|^\s*(query|mutation|subscription)\s+\w+\s*[({])"#,
            // Shell here-docs
            r#"<<-?\s*['"]?\w+"#,
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static regex"))
        .collect();

        Self {
            thresholds,
            embedded,
            format_call: Regex::new(r#"\.format\(|\bf"|\bf'|format!\(|String\.format\("#)
                .expect("static regex"),
            hot_path: Regex::new(r"(?i)(service|handler|controller|view|router)")
                .expect("static regex"),
        }
    }

    /// Evaluate one file. `symbol_count` includes nested methods.
    pub fn evaluate(
        &self,
        path: &str,
        source: &str,
        symbol_count: usize,
    ) -> Option<UnderChunkReason> {
        let bytes = source.len() as u64;
        let lines = source.lines().count() as u32;

        if bytes >= self.thresholds.min_bytes && symbol_count <= 1 {
            return Some(UnderChunkReason::LargeWithFewSymbols);
        }

        if symbol_count > 0 && lines / symbol_count as u32 > self.thresholds.max_lines_per_symbol {
            return Some(UnderChunkReason::SparseSymbols);
        }

        if self.embedded.iter().any(|re| re.is_match(source)) {
            return Some(UnderChunkReason::EmbeddedContent);
        }

        if self.format_call.find_iter(source).count() > self.thresholds.format_calls {
            return Some(UnderChunkReason::FormatCalls);
        }

        if symbol_count < 2 && self.hot_path.is_match(path) {
            return Some(UnderChunkReason::HotPath);
        }

        None
    }
}

/// Count symbols including nested methods.
pub fn total_symbol_count(symbols: &[ParsedSymbol]) -> usize {
    symbols.iter().map(|s| 1 + total_symbol_count(&s.methods)).sum()
}

/// Filter LLM proposals and merge them against the parser's symbols.
///
/// Low-confidence and out-of-range chunks are dropped. A chunk that mostly
/// coincides with a parsed symbol (mutual majority overlap) duplicates it
/// and loses; a chunk nested inside a much larger symbol is new information
/// and survives. Chunks that duplicate each other keep the more confident.
pub fn filter_and_merge(
    parser_symbols: &[ParsedSymbol],
    proposals: Vec<LlmChunk>,
    total_lines: u32,
) -> Vec<LlmChunk> {
    let mut symbol_ranges: Vec<(u32, u32)> = Vec::new();
    flatten_ranges(parser_symbols, &mut symbol_ranges);

    let mut kept: Vec<LlmChunk> = Vec::new();

    for mut chunk in proposals {
        if chunk.confidence < MIN_CHUNK_CONFIDENCE {
            continue;
        }
        if chunk.start_line == 0 || chunk.end_line < chunk.start_line {
            continue;
        }
        if chunk.start_line > total_lines {
            continue;
        }
        chunk.end_line = chunk.end_line.min(total_lines);

        if symbol_ranges
            .iter()
            .any(|&range| mutual_majority_overlap(range, (chunk.start_line, chunk.end_line)))
        {
            continue;
        }

        if let Some(existing) = kept.iter_mut().find(|c| {
            mutual_majority_overlap((c.start_line, c.end_line), (chunk.start_line, chunk.end_line))
        }) {
            if chunk.confidence > existing.confidence {
                *existing = chunk;
            }
            continue;
        }

        kept.push(chunk);
    }

    kept.sort_by_key(|c| (c.start_line, c.end_line));
    kept
}

fn flatten_ranges(symbols: &[ParsedSymbol], out: &mut Vec<(u32, u32)>) {
    for sym in symbols {
        out.push((sym.start_line, sym.end_line));
        flatten_ranges(&sym.methods, out);
    }
}

/// True when each range covers more than half of the other — the two
/// describe the same thing, not a chunk nested inside a bigger symbol.
fn mutual_majority_overlap(a: (u32, u32), b: (u32, u32)) -> bool {
    let overlap_start = a.0.max(b.0);
    let overlap_end = a.1.min(b.1);
    if overlap_start > overlap_end {
        return false;
    }
    let overlap = (overlap_end - overlap_start + 1) as f64;
    let len_a = (a.1 - a.0 + 1) as f64;
    let len_b = (b.1 - b.0 + 1) as f64;
    overlap / len_a > 0.5 && overlap / len_b > 0.5
}
