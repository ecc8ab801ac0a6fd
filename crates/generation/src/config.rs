use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// ComfyUI server and the checkpoints exposed as providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyConfig {
    pub base_url: String,
    pub sampler: String,
    pub sd15_checkpoint: String,
    pub sdxl_checkpoint: String,
    pub steps: u32,
    /// Denoise strength for img2img edits; lower keeps more of the source
    pub edit_denoise: f32,
    pub poll_interval_ms: u64,
}

impl Default for ComfyConfig {
    fn default() -> Self {
        Self {
            base_url: env_string("COMFYUI_BASE_URL", "http://127.0.0.1:8188"),
            sampler: env_string("COMFYUI_DEFAULT_SAMPLER", "euler"),
            sd15_checkpoint: env_string("COMFYUI_CHECKPOINT", "v1-5-pruned-emaonly-fp16.safetensors"),
            sdxl_checkpoint: env_string("COMFYUI_SDXL_CHECKPOINT", "sd_xl_base_1.0.safetensors"),
            steps: env_parse("COMFYUI_STEPS", 22),
            edit_denoise: env_parse("COMFYUI_EDIT_DENOISE", 0.6),
            poll_interval_ms: env_parse("COMFYUI_POLL_INTERVAL_MS", 1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiImageConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenAiImageConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model: env_string("OPENAI_IMAGE_MODEL", "gpt-image-1"),
        }
    }
}

/// Runtime configuration for the generation providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub comfy: ComfyConfig,
    pub openai: OpenAiImageConfig,
    pub provider_timeout_secs: u64,
    /// Explicit allow-list of provider ids; `None` enables every configured provider
    pub enabled_providers: Option<Vec<String>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let enabled_providers = std::env::var("ENABLED_PROVIDERS").ok().map(|list| {
            list.split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect()
        });

        Self {
            comfy: ComfyConfig::default(),
            openai: OpenAiImageConfig::default(),
            provider_timeout_secs: env_parse("PROVIDER_TIMEOUT_SECS", 120),
            enabled_providers,
        }
    }
}

impl GenerationConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    pub fn is_enabled(&self, provider_id: &str) -> bool {
        match &self.enabled_providers {
            Some(ids) => ids.iter().any(|id| id == provider_id),
            None => true,
        }
    }
}
