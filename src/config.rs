//! Configuration document and loader.
//!
//! One JSON file describes providers, models, patterns and tuning. Everything
//! except `models` has defaults; a document without `patterns` gets the
//! built-in ones. Loading validates the whole document before anything runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheSettings;
use crate::gateway::{AdapterSet, OpenAiCompatAdapter, ProviderError};
use crate::patterns::{PatternDefinition, PatternError, TemplateEngine};
use crate::pipeline::{Orchestrator, OrchestratorBuilder, OrchestratorSettings};
use crate::quality::{QualityEvaluator, QualityWeights};
use crate::registry::{ModelDescriptor, ModelRegistry, RegistryError};

pub const DEFAULT_CONFIG_FILE: &str = "ensemble.json";

fn default_min_families() -> usize {
    2
}
fn default_provider_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_min_families")]
    pub min_provider_families: usize,
    /// Keyed by provider family.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub patterns: Vec<PatternDefinition>,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub quality: QualityWeights,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("model '{model}' uses provider family '{family}', which has no provider entry")]
    UnknownProvider { model: String, family: String },
    #[error("provider '{family}': {source}")]
    Provider {
        family: String,
        source: ProviderError,
    },
}

impl EnsembleConfig {
    /// `ENSEMBLE_CONFIG` if set, else `ensemble.json` in the working directory.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ENSEMBLE_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: EnsembleConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry()?;
        self.templates()?;
        for model in self.models.iter().filter(|m| m.enabled) {
            if !self.providers.contains_key(&model.family) {
                return Err(ConfigError::UnknownProvider {
                    model: model.id.clone(),
                    family: model.family.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<ModelRegistry, ConfigError> {
        Ok(ModelRegistry::from_descriptors(
            self.models.clone(),
            self.min_provider_families,
        )?)
    }

    pub fn templates(&self) -> Result<TemplateEngine, ConfigError> {
        if self.patterns.is_empty() {
            return Ok(TemplateEngine::builtin());
        }
        Ok(TemplateEngine::new(self.patterns.clone())?)
    }

    pub fn quality(&self) -> QualityEvaluator {
        QualityEvaluator::new(self.quality.clone())
    }

    /// HTTP adapters for every family an enabled model uses. Reads API keys from
    /// the environment.
    pub fn adapters(&self) -> Result<AdapterSet, ConfigError> {
        let registry = self.registry()?;
        let mut adapters = AdapterSet::new();
        for family in registry.enabled_families() {
            let Some(provider) = self.providers.get(family) else {
                let model = registry
                    .list_enabled()
                    .iter()
                    .find(|m| m.family == family)
                    .map(|m| m.id.clone())
                    .unwrap_or_default();
                return Err(ConfigError::UnknownProvider {
                    model,
                    family: family.to_string(),
                });
            };
            let adapter = match provider.kind {
                ProviderKind::OpenAiCompatible => OpenAiCompatAdapter::from_env(
                    family,
                    &provider.api_key_env,
                    provider.base_url.as_str(),
                    Duration::from_secs(provider.timeout_secs),
                ),
            }
            .map_err(|source| ConfigError::Provider {
                family: family.to_string(),
                source,
            })?;
            adapters.register(Arc::new(adapter));
        }
        Ok(adapters)
    }

    /// Orchestrator builder with registry, templates, quality weights and settings
    /// applied. The caller adds the optional pieces (cache, usage sink).
    pub fn orchestrator(&self, adapters: AdapterSet) -> Result<OrchestratorBuilder, ConfigError> {
        Ok(Orchestrator::builder(self.registry()?, adapters)
            .templates(self.templates()?)
            .quality(self.quality())
            .settings(self.orchestrator.clone()))
    }
}
