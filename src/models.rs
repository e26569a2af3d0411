//! Core data types that flow through the question-answering pipeline.
//!
//! A query moves through three stages — planning, retrieval, generation —
//! and every stage appends one [`PipelineStep`] to the result. The final
//! [`QueryResult`] is immutable once returned; its observable fields are
//! copied into a durable [`Trace`] by the trace recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A retrievable unit of document text, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub title: String,
    pub text: String,
}

/// A chunk annotated with its relevance score for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub score: f64,
}

/// Per-sub-query retrieval report, in planner order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQueryReport {
    pub query: String,
    pub chunks_found: usize,
    pub duration_ms: f64,
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Error,
}

/// Stage-specific step details, discriminated by the step name.
///
/// Serializes with a `name` tag so the wire shape matches
/// `{name, duration_ms, status, ...details}` consumers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum StepDetails {
    Planning {
        sub_queries: Vec<String>,
        model: Option<String>,
        /// Set when the planning model call failed and the deterministic
        /// fallback was applied. Never aborts the query.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Retrieval {
        sub_query_reports: Vec<SubQueryReport>,
        total_chunks: usize,
        unique_sources: usize,
        strategy: String,
    },
    Generation {
        provider: Option<String>,
        model: Option<String>,
        fallback: bool,
        context_tokens: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StepDetails {
    /// The stage name the details belong to: `planning`, `retrieval`,
    /// or `generation`.
    pub fn name(&self) -> &'static str {
        match self {
            StepDetails::Planning { .. } => "planning",
            StepDetails::Retrieval { .. } => "retrieval",
            StepDetails::Generation { .. } => "generation",
        }
    }
}

/// One entry in a query's append-only step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub duration_ms: f64,
    pub status: StepStatus,
    #[serde(flatten)]
    pub details: StepDetails,
}

/// Aggregate metrics for one query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    /// Fraction of the context budget filled with evidence (0..=1).
    pub coverage: f64,
    /// Estimated evidence tokens sent to generation.
    pub tokens: usize,
    /// Wall-clock duration of the whole pipeline.
    pub duration_ms: f64,
    pub chunk_count: usize,
}

/// The pipeline's answer to one question. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    /// Evidence in relevance order, highest first.
    pub evidence: Vec<ScoredChunk>,
    pub trace_id: String,
    pub fallback: bool,
    pub metrics: QueryMetrics,
    pub steps: Vec<PipelineStep>,
}

/// Durable copy of one query's observable fields, keyed by trace id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub prompt: String,
    pub answer: String,
    pub metrics: QueryMetrics,
    pub steps: Vec<PipelineStep>,
}

/// Known local-runtime and cloud provider kinds. Closed set: selection is
/// configuration-driven, never inferred from runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Lmstudio,
    Cloud,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Lmstudio => "lmstudio",
            ProviderKind::Cloud => "cloud",
        }
    }
}

/// Result of probing one local runtime. Probes that fail still produce an
/// entry with `status = "error"` so callers can tell "not installed" from
/// "installed but erroring".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProviderInfo {
    pub kind: ProviderKind,
    pub name: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub running: Vec<String>,
    pub version: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Aggregated outcome of running a named question set through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub name: String,
    pub results: Vec<QueryResult>,
    pub average_coverage: f64,
    pub average_tokens: f64,
}
