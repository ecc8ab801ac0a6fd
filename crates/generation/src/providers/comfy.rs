use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::{
    config::ComfyConfig,
    provider::{
        AdapterError, GeneratedImage, ImageProvider, ProviderFailure, ProviderResult, SourceImage,
        TargetSpec, failure_from_status, failure_from_transport, settle, validate_request,
    },
};

const DEFAULT_NEGATIVE: &str = "lowres, blurry, text artifacts, watermark";

/// One checkpoint on a ComfyUI server, exposed as a provider
pub struct ComfyProvider {
    id: String,
    display_name: String,
    client: Client,
    config: ComfyConfig,
    checkpoint: String,
    long_edge: u32,
    timeout: Duration,
}

impl ComfyProvider {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        client: Client,
        config: ComfyConfig,
        checkpoint: impl Into<String>,
        long_edge: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            client,
            config,
            checkpoint: checkpoint.into(),
            long_edge,
            timeout,
        }
    }

    /// Stable Diffusion 1.5 checkpoint, 512px native
    pub fn sd15(client: Client, config: ComfyConfig, timeout: Duration) -> Self {
        let checkpoint = config.sd15_checkpoint.clone();
        Self::new("comfyui-sd15", "ComfyUI · SD 1.5", client, config, checkpoint, 768, timeout)
    }

    /// SDXL checkpoint, 1024px native
    pub fn sdxl(client: Client, config: ComfyConfig, timeout: Duration) -> Self {
        let checkpoint = config.sdxl_checkpoint.clone();
        Self::new("comfyui-sdxl", "ComfyUI · SDXL", client, config, checkpoint, 1024, timeout)
    }

    fn comfy_endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn seed(target: &TargetSpec) -> i64 {
        target
            .seed
            .map(|s| (s & 0xFFFF_FFFF) as i64)
            .unwrap_or_else(|| (Utc::now().timestamp_nanos_opt().unwrap_or(0) & 0xFFFF_FFFF) as i64)
    }

    fn build_txt2img_workflow(&self, prompt: &str, target: &TargetSpec) -> Value {
        let (width, height) = target.aspect_ratio.dimensions(self.long_edge);
        let negative = target.negative_prompt.as_deref().unwrap_or(DEFAULT_NEGATIVE);
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "cfg": 7,
                    "denoise": 1,
                    "latent_image": ["5", 0],
                    "model": ["4", 0],
                    "negative": ["7", 0],
                    "positive": ["6", 0],
                    "sampler_name": self.config.sampler,
                    "scheduler": "normal",
                    "seed": Self::seed(target),
                    "steps": self.config.steps
                }
            },
            "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": self.checkpoint } },
            "5": { "class_type": "EmptyLatentImage", "inputs": { "batch_size": 1, "height": height, "width": width } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "clip": ["4", 1], "text": prompt } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "clip": ["4", 1], "text": negative } },
            "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ReelEdit", "images": ["8", 0] } }
        })
    }

    /// img2img: encode the uploaded source, resample it at partial denoise
    fn build_img2img_workflow(&self, image_name: &str, instruction: &str, target: &TargetSpec) -> Value {
        let (width, height) = target.aspect_ratio.dimensions(self.long_edge);
        let negative = target.negative_prompt.as_deref().unwrap_or(DEFAULT_NEGATIVE);
        json!({
            "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": self.checkpoint } },
            "2": { "class_type": "LoadImage", "inputs": { "image": image_name } },
            "3": {
                "class_type": "ImageScale",
                "inputs": {
                    "image": ["2", 0],
                    "upscale_method": "lanczos",
                    "width": width,
                    "height": height,
                    "crop": "center"
                }
            },
            "4": { "class_type": "VAEEncode", "inputs": { "pixels": ["3", 0], "vae": ["1", 2] } },
            "5": { "class_type": "CLIPTextEncode", "inputs": { "clip": ["1", 1], "text": instruction } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "clip": ["1", 1], "text": negative } },
            "7": {
                "class_type": "KSampler",
                "inputs": {
                    "cfg": 7,
                    "denoise": self.config.edit_denoise,
                    "latent_image": ["4", 0],
                    "model": ["1", 0],
                    "negative": ["6", 0],
                    "positive": ["5", 0],
                    "sampler_name": self.config.sampler,
                    "scheduler": "normal",
                    "seed": Self::seed(target),
                    "steps": self.config.steps
                }
            },
            "8": { "class_type": "VAEDecode", "inputs": { "samples": ["7", 0], "vae": ["1", 2] } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ReelEdit", "images": ["8", 0] } }
        })
    }

    async fn upload_source(&self, source: &SourceImage) -> Result<String, ProviderFailure> {
        let extension = source.mime_type.rsplit('/').next().unwrap_or("png");
        let part = Part::bytes(source.bytes.to_vec())
            .file_name(format!("reel-source-{}.{}", uuid::Uuid::new_v4(), extension))
            .mime_str(&source.mime_type)
            .map_err(|e| ProviderFailure::internal(format!("invalid source mime type: {e}")))?;
        let form = Form::new().part("image", part).text("overwrite", "true");

        let response = self
            .client
            .post(self.comfy_endpoint("/upload/image"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| failure_from_transport(&e))?;
        let uploaded: UploadResponse = Self::read_json(response).await?;

        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    async fn queue_prompt(&self, workflow: Value) -> Result<String, ProviderFailure> {
        let response = self
            .client
            .post(self.comfy_endpoint("/prompt"))
            .json(&json!({ "prompt": workflow }))
            .send()
            .await
            .map_err(|e| failure_from_transport(&e))?;
        let queued: QueueResponse = Self::read_json(response).await?;
        Ok(queued.prompt_id)
    }

    /// Polls until the prompt has outputs; the caller's timeout bounds the wait.
    async fn poll_history(&self, prompt_id: &str) -> Result<ComfyImageOutput, ProviderFailure> {
        loop {
            let response = self
                .client
                .get(self.comfy_endpoint(&format!("/history/{prompt_id}")))
                .send()
                .await
                .map_err(|e| failure_from_transport(&e))?;
            let history: HistoryResponse = Self::read_json(response).await?;

            if let Some(entry) = history.get(prompt_id) {
                if let Some(error) = entry.status.as_ref().and_then(PromptStatus::error_message) {
                    return Err(ProviderFailure::upstream(error));
                }
                if let Some(image) = entry
                    .outputs
                    .values()
                    .filter_map(|output| output.images.as_ref())
                    .flatten()
                    .next()
                {
                    return Ok(image.clone());
                }
            }

            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    async fn download(&self, image: &ComfyImageOutput) -> Result<GeneratedImage, ProviderFailure> {
        let response = self
            .client
            .get(self.comfy_endpoint("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await
            .map_err(|e| failure_from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure_from_status(status.as_u16(), &body, None));
        }

        let bytes: Bytes = response.bytes().await.map_err(|e| failure_from_transport(&e))?;
        if bytes.is_empty() {
            return Err(ProviderFailure::invalid_response("ComfyUI returned an empty image"));
        }
        Ok(GeneratedImage {
            bytes,
            mime_type: Self::infer_mime(&image.filename).into(),
        })
    }

    async fn render(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        target: &TargetSpec,
    ) -> Result<GeneratedImage, ProviderFailure> {
        let workflow = match source {
            Some(source) => {
                let image_name = self.upload_source(source).await?;
                self.build_img2img_workflow(&image_name, instruction, target)
            }
            None => self.build_txt2img_workflow(instruction, target),
        };
        let prompt_id = self.queue_prompt(workflow).await?;
        tracing::debug!(provider_id = %self.id, prompt_id = %prompt_id, "Queued ComfyUI prompt");
        let output = self.poll_history(&prompt_id).await?;
        self.download(&output).await
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ProviderFailure> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = response.text().await.unwrap_or_default();
            return Err(failure_from_status(status.as_u16(), &body, retry_after.as_deref()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderFailure::invalid_response(e.to_string()))
    }

    fn infer_mime(filename: &str) -> &'static str {
        if filename.ends_with(".webp") {
            "image/webp"
        } else if filename.ends_with(".jpg") || filename.ends_with(".jpeg") {
            "image/jpeg"
        } else if filename.ends_with(".gif") {
            "image/gif"
        } else {
            "image/png"
        }
    }
}

#[async_trait]
impl ImageProvider for ComfyProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn invoke(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        target: &TargetSpec,
    ) -> Result<ProviderResult, AdapterError> {
        validate_request(source, instruction)?;
        Ok(settle(&self.id, self.timeout, self.render(source, instruction, target)).await)
    }
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

// ComfyUI returns history as { "prompt_id": { ... } } without a wrapper
type HistoryResponse = HashMap<String, PromptHistoryEntry>;

#[derive(Debug, Deserialize)]
struct PromptHistoryEntry {
    #[serde(default)]
    outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    status: Option<PromptStatus>,
}

#[derive(Debug, Deserialize)]
struct PromptStatus {
    #[serde(default)]
    status_str: Option<String>,
    #[serde(default)]
    messages: Vec<Value>,
}

impl PromptStatus {
    fn error_message(&self) -> Option<String> {
        if self.status_str.as_deref() != Some("error") {
            return None;
        }
        let detail = self
            .messages
            .iter()
            .filter_map(|m| m.get(1)?.get("exception_message")?.as_str())
            .next()
            .unwrap_or("workflow execution failed");
        Some(detail.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Option<Vec<ComfyImageOutput>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComfyImageOutput {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
}
