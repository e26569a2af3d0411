//! Provider gateway: pluggable generation backends.
//!
//! Three backend kinds behind one capability trait ([`LlmClient`]):
//! Ollama (`/api/chat`), LM Studio and OpenAI-compatible clouds
//! (`/v1/chat/completions`). The kind is a closed enum selected by
//! configuration, never inferred from runtime inspection.
//!
//! Failures are typed ([`ProviderError`]) so the generation step can
//! record exactly what went wrong: timeout, HTTP status, malformed
//! response, or model-not-found. Generation calls are never retried;
//! only the read-only discovery probes in [`discover_local_providers`]
//! are safe to repeat.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProvidersConfig;
use crate::models::{LocalProviderInfo, ProviderKind};
use crate::settings::ProviderConfig;

/// Structured provider failure modes (§4.3).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    Network(String),
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
}

impl ProviderError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Capability set every generation backend implements.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider kind, for step details and trace labeling.
    fn kind(&self) -> ProviderKind;

    /// List the model ids the backend can serve.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// One-shot completion of a prompt with the given model.
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, ProviderError>;
}

/// Build the client for an active provider configuration.
pub fn build_client(cfg: &ProviderConfig, timeout: Duration) -> Box<dyn LlmClient> {
    match cfg.name {
        ProviderKind::Ollama => Box::new(OllamaClient::new(&cfg.base_url, timeout)),
        ProviderKind::Lmstudio => Box::new(OpenAiCompatClient::new(
            ProviderKind::Lmstudio,
            &cfg.base_url,
            None,
            timeout,
        )),
        ProviderKind::Cloud => Box::new(OpenAiCompatClient::new(
            ProviderKind::Cloud,
            &cfg.base_url,
            cfg.api_key.clone(),
            timeout,
        )),
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status.as_u16() == 404 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::ModelNotFound(body));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::Malformed(e.to_string()))
}

// ============ Ollama ============

pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let json = read_json(resp).await?;
        Ok(string_list(&json, "/models", "name"))
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let json = read_json(resp).await?;
        json.pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Malformed("missing message.content".to_string()))
    }
}

// ============ LM Studio / OpenAI-compatible cloud ============

pub struct OpenAiCompatClient {
    kind: ProviderKind,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        kind: ProviderKind,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: http_client(timeout),
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let req = self.client.get(format!("{}/v1/models", self.base_url));
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let json = read_json(resp).await?;
        Ok(string_list(&json, "/data", "id"))
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let json = read_json(resp).await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".to_string()))
    }
}

/// Extract `field` from every object under the array at `pointer`.
fn string_list(json: &Value, pointer: &str, field: &str) -> Vec<String> {
    json.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ============ Local runtime discovery ============

/// Probe the known local runtimes. Every probe target yields an entry:
/// reachable runtimes report their models, unreachable ones report
/// `status = "error"` with the failure message.
pub async fn discover_local_providers(cfg: &ProvidersConfig) -> Vec<LocalProviderInfo> {
    let timeout = Duration::from_secs(cfg.probe_timeout_secs);
    let (ollama, lmstudio) = tokio::join!(
        probe_ollama(&cfg.ollama_url, timeout),
        probe_lmstudio(&cfg.lmstudio_url, timeout),
    );
    vec![ollama, lmstudio]
}

fn error_entry(kind: ProviderKind, name: &str, base_url: &str, err: ProviderError) -> LocalProviderInfo {
    LocalProviderInfo {
        kind,
        name: name.to_string(),
        base_url: base_url.to_string(),
        models: Vec::new(),
        running: Vec::new(),
        version: None,
        status: "error".to_string(),
        error_message: Some(err.to_string()),
    }
}

async fn probe_ollama(base_url: &str, timeout: Duration) -> LocalProviderInfo {
    let base = base_url.trim_end_matches('/');
    let client = http_client(timeout);

    let tags = match client.get(format!("{}/api/tags", base)).send().await {
        Ok(resp) => match read_json(resp).await {
            Ok(json) => json,
            Err(e) => return error_entry(ProviderKind::Ollama, "Ollama", base_url, e),
        },
        Err(e) => {
            return error_entry(
                ProviderKind::Ollama,
                "Ollama",
                base_url,
                ProviderError::from_reqwest(e),
            )
        }
    };
    let models = string_list(&tags, "/models", "name");

    // Loaded models and version are best-effort extras
    let running = match client.get(format!("{}/api/ps", base)).send().await {
        Ok(resp) => read_json(resp)
            .await
            .map(|json| string_list(&json, "/models", "model"))
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    let version = match client.get(format!("{}/api/version", base)).send().await {
        Ok(resp) => read_json(resp)
            .await
            .ok()
            .and_then(|json| json.get("version").and_then(Value::as_str).map(str::to_string)),
        Err(_) => None,
    };

    LocalProviderInfo {
        kind: ProviderKind::Ollama,
        name: "Ollama".to_string(),
        base_url: base_url.to_string(),
        models,
        running,
        version,
        status: "ok".to_string(),
        error_message: None,
    }
}

async fn probe_lmstudio(base_url: &str, timeout: Duration) -> LocalProviderInfo {
    let base = base_url.trim_end_matches('/');
    let client = http_client(timeout);

    let payload = match client.get(format!("{}/api/v0/models", base)).send().await {
        Ok(resp) => match read_json(resp).await {
            Ok(json) => json,
            Err(e) => return error_entry(ProviderKind::Lmstudio, "LM Studio", base_url, e),
        },
        Err(e) => {
            return error_entry(
                ProviderKind::Lmstudio,
                "LM Studio",
                base_url,
                ProviderError::from_reqwest(e),
            )
        }
    };

    let entries = payload
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let models: Vec<String> = entries
        .iter()
        .filter_map(|e| e.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    let running: Vec<String> = entries
        .iter()
        .filter(|e| e.get("state").and_then(Value::as_str) == Some("loaded"))
        .filter_map(|e| e.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();

    let version = match client.get(format!("{}/api/v0/version", base)).send().await {
        Ok(resp) => read_json(resp)
            .await
            .ok()
            .and_then(|json| json.get("version").and_then(Value::as_str).map(str::to_string)),
        Err(_) => None,
    };

    LocalProviderInfo {
        kind: ProviderKind::Lmstudio,
        name: "LM Studio".to_string(),
        base_url: base_url.to_string(),
        models,
        running,
        version,
        status: "ok".to_string(),
        error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_list_extracts_fields() {
        let json = serde_json::json!({
            "models": [
                { "name": "llama3" },
                { "name": "mistral" },
                { "size": 42 }
            ]
        });
        assert_eq!(string_list(&json, "/models", "name"), vec!["llama3", "mistral"]);
        assert!(string_list(&json, "/missing", "name").is_empty());
    }

    #[test]
    fn test_build_client_matches_kind() {
        let cfg = ProviderConfig {
            name: ProviderKind::Lmstudio,
            base_url: "http://localhost:1234".to_string(),
            planner_model: None,
            gatherer_model: None,
            generator_model: Some("qwen".to_string()),
            api_key: None,
        };
        let client = build_client(&cfg, Duration::from_secs(5));
        assert_eq!(client.kind(), ProviderKind::Lmstudio);
    }

    #[tokio::test]
    async fn test_probe_unreachable_runtime_reports_error_entry() {
        // Port 1 is never listening; the probe must still yield an entry
        let cfg = ProvidersConfig {
            ollama_url: "http://127.0.0.1:1".to_string(),
            lmstudio_url: "http://127.0.0.1:1".to_string(),
            generate_timeout_secs: 5,
            probe_timeout_secs: 1,
        };
        let infos = discover_local_providers(&cfg).await;
        assert_eq!(infos.len(), 2);
        for info in infos {
            assert_eq!(info.status, "error");
            assert!(info.error_message.is_some());
            assert!(info.models.is_empty());
        }
    }

    #[tokio::test]
    async fn test_generate_against_dead_endpoint_is_typed_error() {
        let client = OllamaClient::new("http://127.0.0.1:1", Duration::from_secs(1));
        let err = client.generate("hi", "llama3").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Network(_) | ProviderError::Timeout
        ));
    }
}
