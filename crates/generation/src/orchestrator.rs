//! Fan-out of one generation request to K providers, fanned back in as a
//! stream of per-provider results in completion order followed by a single
//! `Done` summary.

use std::{
    any::Any,
    collections::{BTreeMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{FutureExt, StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use ts_rs::TS;

use crate::{
    provider::{
        AdapterError, FailureKind, ImageProvider, ProviderFailure, ProviderOutcome,
        ProviderResult, ProviderStatus, SourceImage, TargetSpec, validate_request,
    },
    registry::ProviderRegistry,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Generation request names no providers")]
    EmptyRequest,
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Provider {0} cannot edit an existing image")]
    EditsUnsupported(String),
    #[error(transparent)]
    InvalidRequest(#[from] AdapterError),
}

/// What the providers start from
#[derive(Debug, Clone)]
pub enum SourceContent {
    Prompt { prompt: String },
    Edit { image: SourceImage, instruction: String },
}

impl SourceContent {
    pub fn instruction(&self) -> &str {
        match self {
            SourceContent::Prompt { prompt } => prompt,
            SourceContent::Edit { instruction, .. } => instruction,
        }
    }

    pub fn image(&self) -> Option<&SourceImage> {
        match self {
            SourceContent::Prompt { .. } => None,
            SourceContent::Edit { image, .. } => Some(image),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub provider_ids: Vec<String>,
    pub source: SourceContent,
    pub target: TargetSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub success_count: usize,
    pub total_count: usize,
    pub failures: BTreeMap<FailureKind, usize>,
}

impl BatchSummary {
    fn new(total_count: usize) -> Self {
        Self {
            total_count,
            ..Default::default()
        }
    }

    fn record(&mut self, result: &ProviderResult) {
        match &result.outcome {
            ProviderOutcome::Success(_) => self.success_count += 1,
            ProviderOutcome::Error(failure) => *self.failures.entry(failure.kind).or_default() += 1,
            ProviderOutcome::Pending => {}
        }
    }

    pub fn message(&self) -> String {
        format!(
            "{} of {} providers succeeded",
            self.success_count, self.total_count
        )
    }

    /// One error for the whole batch when nothing succeeded.
    pub fn aggregate_error(&self) -> Option<String> {
        if self.total_count == 0 || self.success_count > 0 {
            return None;
        }
        let breakdown = self
            .failures
            .iter()
            .map(|(kind, count)| format!("{count} {kind}"))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "All {} providers failed ({breakdown})",
            self.total_count
        ))
    }
}

#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Result(ProviderResult),
    Done(BatchSummary),
}

/// Image bytes as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WirePayload {
    pub mime_type: String,
    pub data: String,
}

/// Streaming event as sent to callers
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireEvent {
    #[serde(rename_all = "camelCase")]
    Result {
        provider_id: String,
        status: ProviderStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        payload: Option<WirePayload>,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        error: Option<ProviderFailure>,
        elapsed_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        success_count: usize,
        total_count: usize,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        error: Option<String>,
    },
}

impl WireEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::Result { .. } => "result",
            WireEvent::Done { .. } => "done",
        }
    }
}

impl From<&GenerationEvent> for WireEvent {
    fn from(event: &GenerationEvent) -> Self {
        match event {
            GenerationEvent::Result(result) => WireEvent::Result {
                provider_id: result.provider_id.clone(),
                status: result.status(),
                payload: result.image().map(|image| WirePayload {
                    mime_type: image.mime_type.clone(),
                    data: STANDARD.encode(&image.bytes),
                }),
                error: result.failure_reason().cloned(),
                elapsed_ms: result.elapsed_ms(),
            },
            GenerationEvent::Done(summary) => WireEvent::Done {
                success_count: summary.success_count,
                total_count: summary.total_count,
                message: summary.message(),
                error: summary.aggregate_error(),
            },
        }
    }
}

/// Every result of a drained batch, in completion order
#[derive(Debug, Clone)]
pub struct GenerationBatch {
    pub results: Vec<ProviderResult>,
    pub summary: BatchSummary,
}

impl GenerationBatch {
    pub fn successes(&self) -> impl Iterator<Item = &ProviderResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn result_for(&self, provider_id: &str) -> Option<&ProviderResult> {
        self.results.iter().find(|r| r.provider_id == provider_id)
    }
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    registry: Arc<ProviderRegistry>,
}

impl GenerationOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Validates `request` and resolves its providers, collapsing duplicate ids.
    pub fn resolve(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<Arc<dyn ImageProvider>>, OrchestratorError> {
        if request.provider_ids.is_empty() {
            return Err(OrchestratorError::EmptyRequest);
        }
        validate_request(request.source.image(), request.source.instruction())?;

        let mut seen = HashSet::new();
        let mut providers = Vec::with_capacity(request.provider_ids.len());
        for id in &request.provider_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let provider = self
                .registry
                .get(id)
                .ok_or_else(|| OrchestratorError::UnknownProvider(id.clone()))?;
            if request.source.image().is_some() && !provider.supports_edits() {
                return Err(OrchestratorError::EditsUnsupported(id.clone()));
            }
            providers.push(provider);
        }
        Ok(providers)
    }

    /// Launches every provider at once and streams their results as they
    /// settle. Dropping the stream stops delivery; provider calls already in
    /// flight finish in the background and their results are discarded.
    pub fn stream(
        &self,
        request: GenerationRequest,
    ) -> Result<BoxStream<'static, GenerationEvent>, OrchestratorError> {
        let providers = self.resolve(&request)?;
        let expected: Vec<String> = providers.iter().map(|p| p.id().to_string()).collect();
        let total = providers.len();
        let request = Arc::new(request);
        let (tx, mut rx) = mpsc::unbounded_channel::<ProviderResult>();

        tracing::info!(providers = ?expected, "Starting generation batch");

        for provider in providers {
            let tx = tx.clone();
            let request = Arc::clone(&request);
            tokio::spawn(async move {
                let result = invoke_settled(provider, &request).await;
                let provider_id = result.provider_id.clone();
                if tx.send(result).is_err() {
                    tracing::debug!(provider_id = %provider_id, "Caller disconnected, dropping provider result");
                }
            });
        }
        drop(tx);

        let stream = async_stream::stream! {
            let mut summary = BatchSummary::new(total);
            let mut settled = HashSet::new();

            while let Some(result) = rx.recv().await {
                if !settled.insert(result.provider_id.clone()) {
                    continue;
                }
                summary.record(&result);
                yield GenerationEvent::Result(result);
            }

            // A task that vanished without sending (runtime shutdown) still owes one event
            for provider_id in expected.into_iter().filter(|id| !settled.contains(id)) {
                let result = ProviderResult::failure(
                    provider_id,
                    ProviderFailure::internal("provider task ended without a result"),
                    Duration::ZERO,
                );
                summary.record(&result);
                yield GenerationEvent::Result(result);
            }

            tracing::info!(
                success_count = summary.success_count,
                total_count = summary.total_count,
                "Generation batch finished"
            );
            yield GenerationEvent::Done(summary);
        };

        Ok(stream.boxed())
    }

    /// Runs a batch to completion for callers that do not stream.
    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationBatch, OrchestratorError> {
        let mut events = self.stream(request)?;
        let mut results = Vec::new();
        let mut summary = BatchSummary::default();
        while let Some(event) = events.next().await {
            match event {
                GenerationEvent::Result(result) => results.push(result),
                GenerationEvent::Done(done) => summary = done,
            }
        }
        Ok(GenerationBatch { results, summary })
    }
}

/// Invokes one provider so that it always yields exactly one settled result,
/// even when the adapter raises or panics.
async fn invoke_settled(provider: Arc<dyn ImageProvider>, request: &GenerationRequest) -> ProviderResult {
    let provider_id = provider.id().to_string();
    let started = Instant::now();
    let call = provider.invoke(request.source.image(), request.source.instruction(), &request.target);
    let outcome = AssertUnwindSafe(call).catch_unwind().await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(result)) if matches!(result.outcome, ProviderOutcome::Pending) => {
            tracing::error!(provider_id = %provider_id, "Provider returned an unsettled result");
            ProviderResult::failure(
                provider_id,
                ProviderFailure::internal("provider returned without settling"),
                elapsed,
            )
        }
        Ok(Ok(result)) => ProviderResult {
            provider_id,
            ..result
        },
        Ok(Err(err)) => {
            tracing::error!(provider_id = %provider_id, "Provider rejected request: {}", err);
            ProviderResult::failure(provider_id, ProviderFailure::internal(err.to_string()), elapsed)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(provider_id = %provider_id, "Provider panicked: {}", reason);
            ProviderResult::failure(
                provider_id,
                ProviderFailure::internal(format!("provider panicked: {reason}")),
                elapsed,
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
