//! Answer generator: turns the question and the selected evidence into a
//! grounded answer.
//!
//! With a provider configured, the evidence is assembled into a grounding
//! prompt (evidence order preserved, each block labeled with its source
//! title) and sent to the generator model. Without a provider, or when the
//! call fails, the step degrades to a deterministic fallback answer with
//! `fallback = true` — a generation failure is recorded in the step
//! details, never raised.

use crate::chunk::estimate_tokens;
use crate::models::{ProviderKind, ScoredChunk};
use crate::provider::LlmClient;

/// What the generation step produced and what it reports.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub answer: String,
    /// True whenever the answer did not come from a model.
    pub fallback: bool,
    /// Estimated tokens of assembled evidence context.
    pub context_tokens: usize,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    /// Model failure absorbed by the fallback, if any.
    pub error: Option<String>,
}

/// Generate an answer from the question and evidence.
pub async fn generate(
    question: &str,
    evidence: &[ScoredChunk],
    client: Option<&dyn LlmClient>,
    generator_model: Option<&str>,
) -> GenerationOutcome {
    let context = assemble_context(evidence);
    let context_tokens = estimate_tokens(&context);

    let (Some(client), Some(model)) = (client, generator_model) else {
        return GenerationOutcome {
            answer: fallback_answer(question, evidence),
            fallback: true,
            context_tokens,
            provider: None,
            model: None,
            error: None,
        };
    };

    if evidence.is_empty() {
        // Nothing to ground on; an ungrounded model answer would be worse
        // than an honest fallback.
        return GenerationOutcome {
            answer: fallback_answer(question, evidence),
            fallback: true,
            context_tokens,
            provider: Some(client.kind()),
            model: Some(model.to_string()),
            error: None,
        };
    }

    let prompt = grounding_prompt(question, &context);
    match client.generate(&prompt, model).await {
        Ok(answer) if !answer.trim().is_empty() => GenerationOutcome {
            answer: answer.trim().to_string(),
            fallback: false,
            context_tokens,
            provider: Some(client.kind()),
            model: Some(model.to_string()),
            error: None,
        },
        Ok(_) => {
            tracing::debug!("generator model returned empty answer, using fallback");
            GenerationOutcome {
                answer: fallback_answer(question, evidence),
                fallback: true,
                context_tokens,
                provider: Some(client.kind()),
                model: Some(model.to_string()),
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "generator model call failed, using fallback");
            GenerationOutcome {
                answer: fallback_answer(question, evidence),
                fallback: true,
                context_tokens,
                provider: Some(client.kind()),
                model: Some(model.to_string()),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Evidence blocks in retrieval order, each labeled with its source title.
fn assemble_context(evidence: &[ScoredChunk]) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}\n{}", i + 1, c.title, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn grounding_prompt(question: &str, context: &str) -> String {
    format!(
        "Answer the question using only the numbered context passages below. \
         If the context does not contain the answer, say so.\n\n\
         Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        context, question
    )
}

/// Deterministic answer used whenever no model answer is available.
fn fallback_answer(question: &str, evidence: &[ScoredChunk]) -> String {
    if evidence.is_empty() {
        format!(
            "No relevant documents were found for: {}. \
             Add documents to the knowledge base and try again.",
            question
        )
    } else {
        let sources: Vec<&str> = {
            let mut seen = Vec::new();
            for c in evidence {
                if !seen.contains(&c.title.as_str()) {
                    seen.push(c.title.as_str());
                }
            }
            seen
        };
        format!(
            "No generation model is available. The most relevant passages \
             for \"{}\" come from: {}.",
            question,
            sources.join(", ")
        )
    }
}
