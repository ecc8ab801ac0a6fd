//! OpenAI Images API provider

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    config::OpenAiImageConfig,
    provider::{
        AdapterError, AspectRatio, GeneratedImage, ImageProvider, ProviderFailure, ProviderResult,
        SourceImage, TargetSpec, failure_from_status, failure_from_transport, settle,
        validate_request,
    },
};

pub const OPENAI_PROVIDER_ID: &str = "openai-image";

pub struct OpenAiImageProvider {
    client: Client,
    config: OpenAiImageConfig,
    timeout: Duration,
}

impl OpenAiImageProvider {
    pub fn new(client: Client, config: OpenAiImageConfig, timeout: Duration) -> Self {
        if config.api_key.is_some() {
            tracing::info!(model = %config.model, "OpenAI image provider initialized with API key");
        } else {
            tracing::warn!("OpenAI image provider created without API key - OPENAI_API_KEY env var not found");
        }
        Self {
            client,
            config,
            timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// The Images API only accepts three sizes; pick the closest orientation.
    fn size_for(aspect_ratio: AspectRatio) -> &'static str {
        if aspect_ratio.is_landscape() {
            "1536x1024"
        } else if aspect_ratio.is_portrait() {
            "1024x1536"
        } else {
            "1024x1024"
        }
    }

    fn prompt_with_negative(instruction: &str, target: &TargetSpec) -> String {
        match target.negative_prompt.as_deref().map(str::trim) {
            Some(negative) if !negative.is_empty() => format!("{instruction}\n\nAvoid: {negative}"),
            _ => instruction.to_string(),
        }
    }

    async fn render(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        target: &TargetSpec,
    ) -> Result<GeneratedImage, ProviderFailure> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(ProviderFailure::unavailable("OPENAI_API_KEY is not configured"));
        };
        let prompt = Self::prompt_with_negative(instruction, target);
        let size = Self::size_for(target.aspect_ratio);

        let request = match source {
            None => self
                .client
                .post(self.endpoint("images/generations"))
                .bearer_auth(api_key)
                .json(&json!({
                    "model": self.config.model,
                    "prompt": prompt,
                    "size": size,
                    "n": 1
                })),
            Some(source) => {
                let extension = source.mime_type.rsplit('/').next().unwrap_or("png");
                let image = Part::bytes(source.bytes.to_vec())
                    .file_name(format!("source.{extension}"))
                    .mime_str(&source.mime_type)
                    .map_err(|e| ProviderFailure::internal(format!("invalid source mime type: {e}")))?;
                let form = Form::new()
                    .text("model", self.config.model.clone())
                    .text("prompt", prompt)
                    .text("size", size)
                    .text("n", "1")
                    .part("image", image);
                self.client
                    .post(self.endpoint("images/edits"))
                    .bearer_auth(api_key)
                    .multipart(form)
            }
        };

        let response = request.send().await.map_err(|e| failure_from_transport(&e))?;
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

        let body: ImagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::invalid_response(e.to_string()))?;
        Self::decode_first(body)
    }

    fn decode_first(body: ImagesResponse) -> Result<GeneratedImage, ProviderFailure> {
        let encoded = body
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| ProviderFailure::invalid_response("response carried no image data"))?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProviderFailure::invalid_response(format!("image data is not base64: {e}")))?;
        if bytes.is_empty() {
            return Err(ProviderFailure::invalid_response("image data is empty"));
        }
        Ok(GeneratedImage {
            bytes: Bytes::from(bytes),
            mime_type: "image/png".into(),
        })
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    fn id(&self) -> &str {
        OPENAI_PROVIDER_ID
    }

    fn display_name(&self) -> &str {
        "OpenAI Images"
    }

    async fn invoke(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        target: &TargetSpec,
    ) -> Result<ProviderResult, AdapterError> {
        validate_request(source, instruction)?;
        Ok(settle(OPENAI_PROVIDER_ID, self.timeout, self.render(source, instruction, target)).await)
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
}
