use std::{collections::BTreeMap, sync::Arc};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    config::GenerationConfig,
    provider::ImageProvider,
    providers::{ComfyProvider, OpenAiImageProvider},
};

#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub supports_edits: bool,
}

/// Provider adapters keyed by id
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the adapters enabled by `config`.
    pub fn from_config(config: &GenerationConfig) -> Self {
        let client = Client::new();
        let timeout = config.provider_timeout();
        let candidates: Vec<Arc<dyn ImageProvider>> = vec![
            Arc::new(ComfyProvider::sd15(client.clone(), config.comfy.clone(), timeout)),
            Arc::new(ComfyProvider::sdxl(client.clone(), config.comfy.clone(), timeout)),
            Arc::new(OpenAiImageProvider::new(client, config.openai.clone(), timeout)),
        ];

        let mut registry = Self::new();
        for provider in candidates {
            if config.is_enabled(provider.id()) {
                registry.register(provider);
            } else {
                tracing::debug!(provider_id = provider.id(), "Provider disabled by ENABLED_PROVIDERS");
            }
        }
        tracing::info!(providers = ?registry.ids(), "Provider registry ready");
        registry
    }

    /// Adds `provider`, replacing any adapter already registered under its id.
    pub fn register(&mut self, provider: Arc<dyn ImageProvider>) {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), provider).is_some() {
            tracing::warn!(provider_id = %id, "Replaced existing provider registration");
        }
    }

    pub fn with(mut self, provider: Arc<dyn ImageProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .values()
            .map(|p| ProviderDescriptor {
                id: p.id().to_string(),
                display_name: p.display_name().to_string(),
                supports_edits: p.supports_edits(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
