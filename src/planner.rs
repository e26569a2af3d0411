//! Query planner: decomposes a question into retrieval sub-queries.
//!
//! With a planner model configured, the question is decomposed into up to
//! [`MAX_SUB_QUERIES`] search queries covering distinct facets. Without
//! one — or when the model call fails or returns nothing usable — the
//! planner degrades deterministically to `[question]`. A planning failure
//! is recorded, never propagated: it must not abort the query.

use crate::provider::LlmClient;
use crate::settings::RetrievalConfig;

pub const MAX_SUB_QUERIES: usize = 4;

/// A retrieval plan: ordered sub-queries plus the budget goals the
/// retriever honors downstream.
#[derive(Debug, Clone)]
pub struct Plan {
    pub sub_queries: Vec<String>,
    pub target_tokens: usize,
    pub coverage_target: f64,
}

/// Plan plus the bookkeeping the planning step records.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub model: Option<String>,
    /// Model failure absorbed by the fallback, if any.
    pub error: Option<String>,
}

/// Produce a retrieval plan for a non-empty question.
pub async fn plan(
    question: &str,
    retrieval: &RetrievalConfig,
    client: Option<&dyn LlmClient>,
    planner_model: Option<&str>,
) -> PlanOutcome {
    let fallback = Plan {
        sub_queries: vec![question.to_string()],
        target_tokens: retrieval.target_tokens,
        coverage_target: retrieval.coverage_target,
    };

    let (Some(client), Some(model)) = (client, planner_model) else {
        // No planning model configured: the fallback is policy, not an error
        return PlanOutcome {
            plan: fallback,
            model: None,
            error: None,
        };
    };

    let prompt = decompose_prompt(question);
    match client.generate(&prompt, model).await {
        Ok(text) => {
            let sub_queries = parse_sub_queries(&text);
            if sub_queries.is_empty() {
                tracing::debug!("planner model returned no usable queries, using fallback");
                PlanOutcome {
                    plan: fallback,
                    model: Some(model.to_string()),
                    error: None,
                }
            } else {
                PlanOutcome {
                    plan: Plan {
                        sub_queries,
                        ..fallback
                    },
                    model: Some(model.to_string()),
                    error: None,
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "planner model call failed, using fallback");
            PlanOutcome {
                plan: fallback,
                model: Some(model.to_string()),
                error: Some(e.to_string()),
            }
        }
    }
}

fn decompose_prompt(question: &str) -> String {
    format!(
        "Decompose the question below into at most {} short search queries, \
         each covering a distinct facet. Output one query per line with no \
         numbering and no commentary.\n\nQuestion: {}",
        MAX_SUB_QUERIES, question
    )
}

/// Parse one query per output line, stripping list markers the model may
/// add anyway. Order is preserved; duplicates are dropped.
fn parse_sub_queries(text: &str) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '-' || c == '*' || c == '.')
            .trim()
            .to_string();
        if cleaned.is_empty() || queries.iter().any(|q| q == &cleaned) {
            continue;
        }
        queries.push(cleaned);
        if queries.len() == MAX_SUB_QUERIES {
            break;
        }
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use crate::provider::ProviderError;
    use async_trait::async_trait;

    struct FixedClient(Result<String, String>);

    #[async_trait]
    impl LlmClient for FixedClient {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Ollama
        }
        async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec![])
        }
        async fn generate(&self, _prompt: &str, _model: &str) -> Result<String, ProviderError> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(msg) => Err(ProviderError::Network(msg.clone())),
            }
        }
    }

    #[tokio::test]
    async fn test_no_model_returns_question_unchanged() {
        let cfg = RetrievalConfig::default();
        let outcome = plan("What is RAG?", &cfg, None, None).await;
        assert_eq!(outcome.plan.sub_queries, vec!["What is RAG?"]);
        assert_eq!(outcome.plan.target_tokens, cfg.target_tokens);
        assert!(outcome.error.is_none());
        assert!(outcome.model.is_none());
    }

    #[tokio::test]
    async fn test_model_lines_become_sub_queries() {
        let cfg = RetrievalConfig::default();
        let client = FixedClient(Ok("1. retrieval augmentation\n2. vector search\n\n".into()));
        let outcome = plan("What is RAG?", &cfg, Some(&client), Some("m")).await;
        assert_eq!(
            outcome.plan.sub_queries,
            vec!["retrieval augmentation", "vector search"]
        );
        assert_eq!(outcome.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_without_error_propagation() {
        let cfg = RetrievalConfig::default();
        let client = FixedClient(Err("connection refused".into()));
        let outcome = plan("What is RAG?", &cfg, Some(&client), Some("m")).await;
        assert_eq!(outcome.plan.sub_queries, vec!["What is RAG?"]);
        assert!(outcome.error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_blank_model_output_falls_back() {
        let cfg = RetrievalConfig::default();
        let client = FixedClient(Ok("   \n\n".into()));
        let outcome = plan("What is RAG?", &cfg, Some(&client), Some("m")).await;
        assert_eq!(outcome.plan.sub_queries, vec!["What is RAG?"]);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_parse_caps_and_dedups() {
        let text = "a\nb\na\nc\nd\ne";
        assert_eq!(parse_sub_queries(text), vec!["a", "b", "c", "d"]);
    }
}
