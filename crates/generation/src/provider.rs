//! Uniform result shape for external image model calls.
//!
//! Each adapter owns its wire schema and folds ordinary failures (rate limits,
//! policy rejections, timeouts, upstream errors) into a [`ProviderResult`]
//! with [`ProviderStatus::Error`]. Only malformed requests surface as
//! [`AdapterError`].

use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid generation request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "3:4")]
    ClassicPortrait,
}

impl AspectRatio {
    fn ratio(self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1, 1),
            AspectRatio::Landscape => (16, 9),
            AspectRatio::Portrait => (9, 16),
            AspectRatio::Classic => (4, 3),
            AspectRatio::ClassicPortrait => (3, 4),
        }
    }

    /// Width and height with the longer edge at `long_edge`, the shorter one
    /// rounded down to a multiple of 64 for latent-space models.
    pub fn dimensions(self, long_edge: u32) -> (u32, u32) {
        let (w, h) = self.ratio();
        let short = |num: u32, den: u32| ((long_edge * num / den) / 64 * 64).max(64);
        if w >= h {
            (long_edge, short(h, w))
        } else {
            (short(w, h), long_edge)
        }
    }

    pub fn is_landscape(self) -> bool {
        let (w, h) = self.ratio();
        w > h
    }

    pub fn is_portrait(self) -> bool {
        let (w, h) = self.ratio();
        h > w
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.ratio();
        write!(f, "{w}:{h}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
pub struct TargetSpec {
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    #[ts(optional)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    #[ts(optional)]
    pub seed: Option<u64>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    PolicyRejected,
    Timeout,
    Upstream,
    InvalidResponse,
    Unavailable,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::RateLimited => write!(f, "rate_limited"),
            FailureKind::PolicyRejected => write!(f, "policy_rejected"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Upstream => write!(f, "upstream"),
            FailureKind::InvalidResponse => write!(f, "invalid_response"),
            FailureKind::Unavailable => write!(f, "unavailable"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// Structured reason a provider produced no image
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub retry_after_ms: Option<u64>,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: "provider rate limit reached".into(),
            retry_after_ms,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Upstream, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidResponse, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Pending,
    Success(GeneratedImage),
    Error(ProviderFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResult {
    pub provider_id: String,
    pub outcome: ProviderOutcome,
    pub elapsed: Duration,
}

impl ProviderResult {
    pub fn pending(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            outcome: ProviderOutcome::Pending,
            elapsed: Duration::ZERO,
        }
    }

    pub fn success(provider_id: impl Into<String>, image: GeneratedImage, elapsed: Duration) -> Self {
        Self {
            provider_id: provider_id.into(),
            outcome: ProviderOutcome::Success(image),
            elapsed,
        }
    }

    pub fn failure(
        provider_id: impl Into<String>,
        failure: ProviderFailure,
        elapsed: Duration,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            outcome: ProviderOutcome::Error(failure),
            elapsed,
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self.outcome {
            ProviderOutcome::Pending => ProviderStatus::Pending,
            ProviderOutcome::Success(_) => ProviderStatus::Success,
            ProviderOutcome::Error(_) => ProviderStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProviderOutcome::Success(_))
    }

    pub fn image(&self) -> Option<&GeneratedImage> {
        match &self.outcome {
            ProviderOutcome::Success(image) => Some(image),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&ProviderFailure> {
        match &self.outcome {
            ProviderOutcome::Error(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// One external image model.
///
/// Implementations hold no per-call state; concurrent `invoke` calls on the
/// same adapter are independent.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    fn supports_edits(&self) -> bool {
        true
    }

    /// Generate from `instruction`, editing `source` when one is given.
    async fn invoke(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        target: &TargetSpec,
    ) -> Result<ProviderResult, AdapterError>;
}

/// Rejects requests no provider could serve.
pub fn validate_request(
    source: Option<&SourceImage>,
    instruction: &str,
) -> Result<(), AdapterError> {
    if instruction.trim().is_empty() {
        return Err(AdapterError::InvalidRequest("instruction is empty".into()));
    }
    if let Some(source) = source {
        if source.bytes.is_empty() {
            return Err(AdapterError::InvalidRequest("source image is empty".into()));
        }
        if !source.mime_type.starts_with("image/") {
            return Err(AdapterError::InvalidRequest(format!(
                "source mime type {} is not an image",
                source.mime_type
            )));
        }
    }
    Ok(())
}

/// Run one provider call under `timeout` and fold its outcome into a result
/// carrying the elapsed wall time.
pub async fn settle<F>(provider_id: &str, timeout: Duration, call: F) -> ProviderResult
where
    F: Future<Output = Result<GeneratedImage, ProviderFailure>>,
{
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(image)) => ProviderOutcome::Success(image),
        Ok(Err(failure)) => ProviderOutcome::Error(failure),
        Err(_) => ProviderOutcome::Error(ProviderFailure::timeout(format!(
            "no response within {}s",
            timeout.as_secs_f32()
        ))),
    };
    let elapsed = started.elapsed();

    match &outcome {
        ProviderOutcome::Error(failure) => {
            tracing::warn!(provider_id, elapsed_ms = elapsed.as_millis() as u64, "Provider failed: {}", failure);
        }
        _ => {
            tracing::debug!(provider_id, elapsed_ms = elapsed.as_millis() as u64, "Provider settled");
        }
    }

    ProviderResult {
        provider_id: provider_id.to_string(),
        outcome,
        elapsed,
    }
}

const POLICY_MARKERS: [&str; 4] = ["content_policy", "moderation", "safety", "policy_violation"];

/// Map a non-success HTTP response into a failure.
pub fn failure_from_status(status: u16, body: &str, retry_after: Option<&str>) -> ProviderFailure {
    let excerpt: String = body.chars().take(300).collect();
    match status {
        429 => ProviderFailure::rate_limited(
            retry_after
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|secs| (secs * 1000.0) as u64),
        ),
        400 | 403 | 422
            if POLICY_MARKERS
                .iter()
                .any(|marker| body.to_ascii_lowercase().contains(marker)) =>
        {
            ProviderFailure::new(FailureKind::PolicyRejected, excerpt)
        }
        401 | 403 => ProviderFailure::unavailable(format!("authentication failed ({status})")),
        408 | 504 => ProviderFailure::timeout(format!("upstream timed out ({status})")),
        503 => ProviderFailure::unavailable(format!("service unavailable: {excerpt}")),
        _ => ProviderFailure::upstream(format!("HTTP {status}: {excerpt}")),
    }
}

/// Map a transport-level reqwest error into a failure.
pub fn failure_from_transport(err: &reqwest::Error) -> ProviderFailure {
    if err.is_timeout() {
        ProviderFailure::timeout(err.to_string())
    } else if err.is_connect() {
        ProviderFailure::unavailable(err.to_string())
    } else if err.is_decode() {
        ProviderFailure::invalid_response(err.to_string())
    } else {
        ProviderFailure::upstream(err.to_string())
    }
}
