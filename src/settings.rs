//! Mutable runtime settings: retrieval parameters, the active provider, and
//! named provider profiles.
//!
//! The [`SettingsStore`] owns a versioned in-memory copy and persists every
//! change to a JSON file with an atomic write-then-rename, so concurrent
//! readers never observe a half-written settings file. Pipeline calls read
//! an immutable snapshot; nothing mutates settings mid-query.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Retrieval parameter bundle consumed by the planner and retriever.
/// Read-only during a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub hybrid: bool,
    pub dense_k: usize,
    pub sparse_k: usize,
    pub rerank_pool: usize,
    pub top_n: usize,
    pub compression: bool,
    pub target_tokens: usize,
    /// `off` or `on` — hierarchical document-first selection.
    pub raptor: String,
    /// Co-retrieval graph expansion before reranking.
    pub graph: bool,
    pub coverage_target: f64,
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        balanced_preset()
    }
}

impl RetrievalConfig {
    /// Enforces the §3 invariants; every write path goes through this.
    pub fn validate(&self) -> Result<()> {
        if self.top_n > self.rerank_pool {
            bail!(
                "top_n ({}) must not exceed rerank_pool ({})",
                self.top_n,
                self.rerank_pool
            );
        }
        if !(0.0..=1.0).contains(&self.coverage_target) {
            bail!("coverage_target must be in [0.0, 1.0]");
        }
        if self.max_context_tokens == 0 {
            bail!("max_context_tokens must be > 0");
        }
        match self.raptor.as_str() {
            "off" | "on" => {}
            other => bail!("raptor must be 'off' or 'on', got '{}'", other),
        }
        Ok(())
    }

    pub fn raptor_enabled(&self) -> bool {
        self.raptor == "on"
    }
}

/// Which runtime and model triad to use for each pipeline role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: crate::models::ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub planner_model: Option<String>,
    #[serde(default)]
    pub gatherer_model: Option<String>,
    #[serde(default)]
    pub generator_model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// A named, saved ProviderConfig snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub provider: ProviderConfig,
}

/// Everything the settings store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Exactly one provider is active at a time; `None` means the pipeline
    /// runs in deterministic fallback mode.
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub profiles: Vec<ProviderProfile>,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.retrieval.validate()
    }
}

// ============ Presets ============

pub const PRESET_NAMES: [&str; 3] = ["fast", "balanced", "thorough"];

fn fast_preset() -> RetrievalConfig {
    RetrievalConfig {
        hybrid: true,
        dense_k: 3,
        sparse_k: 5,
        rerank_pool: 6,
        top_n: 3,
        compression: false,
        target_tokens: 800,
        raptor: "off".to_string(),
        graph: false,
        coverage_target: 0.5,
        max_context_tokens: 2048,
    }
}

fn balanced_preset() -> RetrievalConfig {
    RetrievalConfig {
        hybrid: true,
        dense_k: 5,
        sparse_k: 10,
        rerank_pool: 10,
        top_n: 5,
        compression: false,
        target_tokens: 1600,
        raptor: "off".to_string(),
        graph: false,
        coverage_target: 0.7,
        max_context_tokens: 4096,
    }
}

fn thorough_preset() -> RetrievalConfig {
    RetrievalConfig {
        hybrid: true,
        dense_k: 10,
        sparse_k: 20,
        rerank_pool: 20,
        top_n: 10,
        compression: true,
        target_tokens: 3000,
        raptor: "off".to_string(),
        graph: false,
        coverage_target: 0.9,
        max_context_tokens: 8192,
    }
}

/// Look up a preset by name. Presets are total values: applying one
/// replaces the active RetrievalConfig wholesale.
pub fn preset(name: &str) -> Option<RetrievalConfig> {
    match name.to_ascii_lowercase().as_str() {
        "fast" => Some(fast_preset()),
        "balanced" => Some(balanced_preset()),
        "thorough" => Some(thorough_preset()),
        _ => None,
    }
}

/// All presets, keyed by name, for the listing endpoint.
pub fn all_presets() -> Vec<(&'static str, RetrievalConfig)> {
    vec![
        ("fast", fast_preset()),
        ("balanced", balanced_preset()),
        ("thorough", thorough_preset()),
    ]
}

// ============ Store ============

/// Owns the active [`Settings`] and persists every change atomically.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Open the store, loading existing settings or writing defaults.
    pub fn open(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
            let settings: Settings =
                serde_json::from_str(&raw).with_context(|| "Failed to parse settings file")?;
            settings.validate()?;
            settings
        } else {
            Settings::default()
        };

        let store = Self {
            path: path.to_path_buf(),
            current: RwLock::new(settings),
        };
        if !store.path.exists() {
            store.persist(&store.snapshot())?;
        }
        Ok(store)
    }

    /// Immutable copy of the current settings, handed to pipeline calls.
    pub fn snapshot(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Replace the settings wholesale. Validates before anything is
    /// committed, so a bad write leaves the previous settings intact.
    pub fn replace(&self, settings: Settings) -> Result<Settings> {
        settings.validate()?;
        self.persist(&settings)?;
        *self.current.write().expect("settings lock poisoned") = settings.clone();
        Ok(settings)
    }

    /// Apply a named preset to the active retrieval configuration.
    pub fn apply_preset(&self, name: &str) -> Result<Settings> {
        let retrieval = preset(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown preset '{}'. Available: {}",
                name,
                PRESET_NAMES.join(", ")
            )
        })?;
        let mut settings = self.snapshot();
        settings.retrieval = retrieval;
        self.replace(settings)
    }

    /// Save a named profile. An existing profile of the same name is
    /// replaced; profiles of other names are never deleted.
    pub fn save_profile(&self, name: &str, provider: ProviderConfig) -> Result<Settings> {
        if name.trim().is_empty() {
            bail!("profile name must not be empty");
        }
        let mut settings = self.snapshot();
        match settings.profiles.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.provider = provider,
            None => settings.profiles.push(ProviderProfile {
                name: name.to_string(),
                provider,
            }),
        }
        self.replace(settings)
    }

    /// Activate a saved profile: swaps the active ProviderConfig atomically.
    pub fn activate_profile(&self, name: &str) -> Result<Settings> {
        let mut settings = self.snapshot();
        let profile = settings
            .profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("profile not found: {}", name))?;
        settings.provider = Some(profile.provider);
        self.replace(settings)
    }

    /// Write-then-rename so readers never see a torn file.
    fn persist(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)
            .with_context(|| format!("Failed to write settings file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
