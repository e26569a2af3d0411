use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Static deployment configuration, loaded from a TOML file at startup.
///
/// Mutable runtime settings (retrieval parameters, the active provider)
/// live in [`crate::settings`] instead; this file only holds what an
/// operator sets once per deployment.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Sidecar JSON file for mutable runtime settings. Defaults to
    /// `settings.json` next to the database.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7411".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `ollama`, or `openai`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            base_url: None,
            timeout_secs: default_embed_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

/// Probe targets and call timeouts for the provider gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_lmstudio_url")]
    pub lmstudio_url: String,
    /// Timeout for generation calls. A timed-out call is a provider
    /// failure, never a hung request.
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    /// Timeout for read-only discovery probes.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama_url: default_ollama_url(),
            lmstudio_url: default_lmstudio_url(),
            generate_timeout_secs: default_generate_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_ollama_url() -> String {
    std::env::var("RAG_OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}
fn default_lmstudio_url() -> String {
    std::env::var("RAG_LMSTUDIO_URL").unwrap_or_else(|_| "http://localhost:1234".to_string())
}
fn default_generate_timeout_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    3
}

impl Config {
    /// Resolved path of the runtime settings file.
    pub fn settings_path(&self) -> PathBuf {
        match &self.db.settings_path {
            Some(p) => p.clone(),
            None => self
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("settings.json"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.providers.generate_timeout_secs == 0 {
        anyhow::bail!("providers.generate_timeout_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config("[db]\npath = \"/tmp/rag.sqlite\"\n");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:7411");
        assert_eq!(cfg.chunking.max_tokens, 200);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.providers.generate_timeout_secs, 60);
    }

    #[test]
    fn test_settings_path_defaults_next_to_db() {
        let f = write_config("[db]\npath = \"/data/rag.sqlite\"\n");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.settings_path(), PathBuf::from("/data/settings.json"));
    }

    #[test]
    fn test_embedding_requires_model() {
        let f = write_config("[db]\npath = \"/tmp/rag.sqlite\"\n[embedding]\nprovider = \"ollama\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let f = write_config(
            "[db]\npath = \"/tmp/rag.sqlite\"\n[embedding]\nprovider = \"bert\"\nmodel = \"m\"\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let f = write_config("[db]\npath = \"/tmp/rag.sqlite\"\n[chunking]\nmax_tokens = 0\n");
        assert!(load_config(f.path()).is_err());
    }
}
