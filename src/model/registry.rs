use anyhow::anyhow;
use serde::Deserialize;

use crate::{
    error::{Result, StemError},
    types::StemKind,
};

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub stems: Vec<String>,
    pub segment_secs: Option<f32>,
}

impl RegistryEntry {
    /// Stem layout in model output order.
    pub fn layout(&self) -> Result<Vec<StemKind>> {
        self.stems
            .iter()
            .map(|s| {
                StemKind::from_key(s)
                    .ok_or_else(|| {
                        StemError::from(anyhow!("model `{}` declares unknown stem `{s}`", self.name))
                    })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct Registry {
    pub default: String,
    pub models: Vec<RegistryEntry>,
}

const REGISTRY_JSON: &str = include_str!("../../models/registry.json");

pub fn registry() -> Result<Registry> {
    Ok(serde_json::from_str(REGISTRY_JSON)?)
}

pub fn resolve(model_name: &str) -> Result<RegistryEntry> {
    let reg = registry()?;
    let target = if model_name.is_empty() {
        reg.default
    } else {
        model_name.to_string()
    };

    reg.models
        .into_iter()
        .find(|m| m.name == target)
        .ok_or_else(|| StemError::from(anyhow!("Model `{target}` not found in registry")))
}
