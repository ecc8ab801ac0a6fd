//! Image generation across multiple model providers.

pub mod config;
pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::GenerationConfig;
pub use orchestrator::{
    BatchSummary, GenerationBatch, GenerationEvent, GenerationOrchestrator, GenerationRequest,
    OrchestratorError, SourceContent, WireEvent,
};
pub use provider::{
    AdapterError, AspectRatio, FailureKind, GeneratedImage, ImageProvider, ProviderFailure,
    ProviderOutcome, ProviderResult, ProviderStatus, SourceImage, TargetSpec,
};
pub use registry::{ProviderDescriptor, ProviderRegistry};
