//! Model descriptor registry.
//!
//! Loaded once at startup; read-only afterwards. Construction fails if too few
//! distinct provider families are enabled, and [`ModelRegistry::validate_adapters`]
//! fails if an enabled family has no adapter to dispatch to.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::AdapterSet;

fn default_true() -> bool {
    true
}

/// One configured model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    /// Provider family; selects the adapter.
    pub family: String,
    /// Lower is preferred.
    pub priority: u32,
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Whether the model takes part in the META critique round.
    #[serde(default = "default_true")]
    pub meta_capable: bool,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, family: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            family: family.into(),
            priority,
            rate_limit_per_minute: 60,
            enabled: true,
            label: None,
            meta_capable: true,
        }
    }

    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn meta_capable(mut self, capable: bool) -> Self {
        self.meta_capable = capable;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Human label, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    fn sort_key(&self) -> (u32, &str) {
        (self.priority, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("model '{0}' not found")]
    NotFound(String),
    #[error("model '{0}' is disabled")]
    Disabled(String),
    #[error("duplicate model id '{0}'")]
    DuplicateId(String),
    #[error("model id must be non-empty")]
    EmptyId,
    #[error("model '{0}' has an empty provider family")]
    EmptyFamily(String),
    #[error("model '{0}' must allow at least one request per minute")]
    ZeroRateLimit(String),
    #[error("{found} distinct provider families enabled, at least {required} required")]
    InsufficientFamilies { found: usize, required: usize },
    #[error("no adapter registered for provider family '{family}' (used by model '{model}')")]
    MissingAdapter { family: String, model: String },
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDescriptor>,
    /// Enabled models sorted by (priority, id).
    enabled: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    pub fn from_descriptors(
        descriptors: Vec<ModelDescriptor>,
        min_families: usize,
    ) -> Result<Self, RegistryError> {
        let mut models = HashMap::with_capacity(descriptors.len());
        for desc in descriptors {
            if desc.id.trim().is_empty() {
                return Err(RegistryError::EmptyId);
            }
            if desc.family.trim().is_empty() {
                return Err(RegistryError::EmptyFamily(desc.id));
            }
            if desc.enabled && desc.rate_limit_per_minute == 0 {
                return Err(RegistryError::ZeroRateLimit(desc.id));
            }
            if models.contains_key(&desc.id) {
                return Err(RegistryError::DuplicateId(desc.id));
            }
            models.insert(desc.id.clone(), desc);
        }

        let mut enabled: Vec<ModelDescriptor> =
            models.values().filter(|m| m.enabled).cloned().collect();
        enabled.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let families: BTreeSet<&str> = enabled.iter().map(|m| m.family.as_str()).collect();
        if families.len() < min_families {
            return Err(RegistryError::InsufficientFamilies {
                found: families.len(),
                required: min_families,
            });
        }

        Ok(Self { models, enabled })
    }

    /// Every enabled model must be dispatchable.
    pub fn validate_adapters(&self, adapters: &AdapterSet) -> Result<(), RegistryError> {
        for model in &self.enabled {
            if !adapters.contains(&model.family) {
                return Err(RegistryError::MissingAdapter {
                    family: model.family.clone(),
                    model: model.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn list_enabled(&self) -> &[ModelDescriptor] {
        &self.enabled
    }

    pub fn resolve(&self, id: &str) -> Result<&ModelDescriptor, RegistryError> {
        match self.models.get(id) {
            Some(m) if m.enabled => Ok(m),
            Some(m) => Err(RegistryError::Disabled(m.id.clone())),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    pub fn highest_priority_enabled(&self) -> Option<&ModelDescriptor> {
        self.enabled.first()
    }

    pub fn enabled_families(&self) -> Vec<&str> {
        let families: BTreeSet<&str> = self.enabled.iter().map(|m| m.family.as_str()).collect();
        families.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
