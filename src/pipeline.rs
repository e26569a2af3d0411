//! The query pipeline: plan, retrieve, generate, trace.
//!
//! [`Pipeline::ask`] is the single entry point for answering a question.
//! It reads an immutable settings snapshot up front, runs the three stages
//! in order, appends one step per stage, and records exactly one trace for
//! every result it returns.
//!
//! Failure policy: an empty question is rejected before the pipeline
//! starts and leaves no trace. Model failures in planning or generation
//! degrade to deterministic fallbacks and are recorded in the step
//! details. Store failures are infrastructure errors and propagate.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ProvidersConfig;
use crate::generator;
use crate::models::{
    EvaluationReport, PipelineStep, QueryMetrics, QueryResult, StepDetails, StepStatus,
};
use crate::planner;
use crate::provider::{build_client, LlmClient};
use crate::retriever;
use crate::settings::{Settings, SettingsStore};
use crate::store::ChunkStore;
use crate::trace::TraceRecorder;

pub struct Pipeline {
    store: Arc<dyn ChunkStore>,
    settings: Arc<SettingsStore>,
    traces: TraceRecorder,
    providers: ProvidersConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        settings: Arc<SettingsStore>,
        traces: TraceRecorder,
        providers: ProvidersConfig,
    ) -> Self {
        Self {
            store,
            settings,
            traces,
            providers,
        }
    }

    pub fn traces(&self) -> &TraceRecorder {
        &self.traces
    }

    /// Answer one question. Runs all three stages, records one trace, and
    /// returns the result with its full step list.
    pub async fn ask(&self, question: &str) -> Result<QueryResult> {
        let question = question.trim();
        if question.is_empty() {
            bail!("question must not be empty");
        }

        let settings = self.settings.snapshot();
        let retrieval_cfg = settings.retrieval.clone();
        let client = active_client(&settings, &self.providers);
        let client_ref = client.as_deref();

        let pipeline_started = Instant::now();
        let mut steps: Vec<PipelineStep> = Vec::with_capacity(3);

        // Stage 1: planning
        let started = Instant::now();
        let planned = planner::plan(
            question,
            &retrieval_cfg,
            client_ref,
            role_model(&settings, Role::Planner).as_deref(),
        )
        .await;
        // A failed planner call is absorbed by the fallback plan: the step
        // completes, with the failure noted in the details.
        steps.push(PipelineStep {
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            status: StepStatus::Completed,
            details: StepDetails::Planning {
                sub_queries: planned.plan.sub_queries.clone(),
                model: planned.model.clone(),
                error: planned.error.clone(),
            },
        });

        // Stage 2: retrieval. Store errors propagate; no trace is written
        // for a query that never produced an answer.
        let started = Instant::now();
        let retrieved =
            retriever::retrieve(self.store.as_ref(), &planned.plan, &retrieval_cfg).await?;
        steps.push(PipelineStep {
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            status: StepStatus::Completed,
            details: StepDetails::Retrieval {
                sub_query_reports: retrieved.sub_query_reports.clone(),
                total_chunks: retrieved.total_chunks,
                unique_sources: retrieved.unique_sources,
                strategy: retrieved.strategy.to_string(),
            },
        });

        // Stage 3: generation
        let started = Instant::now();
        let generated = generator::generate(
            question,
            &retrieved.evidence,
            client_ref,
            role_model(&settings, Role::Generator).as_deref(),
        )
        .await;
        steps.push(PipelineStep {
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            status: status_for(generated.error.as_deref()),
            details: StepDetails::Generation {
                provider: generated.provider.map(|k| k.as_str().to_string()),
                model: generated.model.clone(),
                fallback: generated.fallback,
                context_tokens: generated.context_tokens,
                error: generated.error.clone(),
            },
        });

        let metrics = QueryMetrics {
            coverage: retrieved.coverage,
            tokens: retrieved.context_tokens,
            duration_ms: pipeline_started.elapsed().as_secs_f64() * 1000.0,
            chunk_count: retrieved.evidence.len(),
        };

        let trace_id = self
            .traces
            .record(question, &generated.answer, &metrics, &steps)
            .await?;

        Ok(QueryResult {
            answer: generated.answer,
            evidence: retrieved.evidence,
            trace_id,
            fallback: generated.fallback,
            metrics,
            steps,
        })
    }

    /// Run a named question set through the pipeline and aggregate the
    /// metrics. Each question records its own trace, same as `ask`.
    pub async fn evaluate(&self, name: &str, questions: &[String]) -> Result<EvaluationReport> {
        if questions.is_empty() {
            bail!("evaluation requires at least one question");
        }

        let mut results = Vec::with_capacity(questions.len());
        for question in questions {
            results.push(self.ask(question).await?);
        }

        let n = results.len() as f64;
        let average_coverage = results.iter().map(|r| r.metrics.coverage).sum::<f64>() / n;
        let average_tokens = results.iter().map(|r| r.metrics.tokens as f64).sum::<f64>() / n;

        Ok(EvaluationReport {
            name: name.to_string(),
            results,
            average_coverage,
            average_tokens,
        })
    }
}

fn status_for(error: Option<&str>) -> StepStatus {
    if error.is_some() {
        StepStatus::Error
    } else {
        StepStatus::Completed
    }
}

enum Role {
    Planner,
    Generator,
}

/// Resolve the model for a pipeline role. A role without a specific
/// assignment falls back to the gatherer model, the provider's
/// general-purpose slot.
fn role_model(settings: &Settings, role: Role) -> Option<String> {
    let provider = settings.provider.as_ref()?;
    let specific = match role {
        Role::Planner => provider.planner_model.as_ref(),
        Role::Generator => provider.generator_model.as_ref(),
    };
    specific.or(provider.gatherer_model.as_ref()).cloned()
}

fn active_client(settings: &Settings, providers: &ProvidersConfig) -> Option<Box<dyn LlmClient>> {
    let provider = settings.provider.as_ref()?;
    Some(build_client(
        provider,
        Duration::from_secs(providers.generate_timeout_secs),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use crate::settings::ProviderConfig;

    #[test]
    fn test_role_model_falls_back_to_gatherer() {
        let mut settings = Settings::default();
        settings.provider = Some(ProviderConfig {
            name: ProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            planner_model: None,
            gatherer_model: Some("llama3".to_string()),
            generator_model: Some("qwen".to_string()),
            api_key: None,
        });
        assert_eq!(
            role_model(&settings, Role::Planner).as_deref(),
            Some("llama3")
        );
        assert_eq!(
            role_model(&settings, Role::Generator).as_deref(),
            Some("qwen")
        );
    }

    #[test]
    fn test_role_model_none_without_provider() {
        let settings = Settings::default();
        assert!(role_model(&settings, Role::Generator).is_none());
    }
}
