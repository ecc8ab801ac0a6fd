//! In-process providers with scripted outcomes for tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::provider::{
    AdapterError, FailureKind, GeneratedImage, ImageProvider, ProviderFailure, ProviderResult,
    SourceImage, TargetSpec,
};

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    Fail(FailureKind),
    Raise,
    Panic,
}

pub struct ScriptedProvider {
    id: String,
    script: Script,
    supports_edits: bool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    calls: AtomicUsize,
    completed: AtomicUsize,
    last_source: Mutex<Option<Bytes>>,
    last_instruction: Mutex<Option<String>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, script: Script) -> Arc<Self> {
        Arc::new(Self::build(id, script, None))
    }

    /// Holds the call open until `gate` fires or its sender is dropped.
    pub fn gated(id: &str, script: Script, gate: oneshot::Receiver<()>) -> Arc<Self> {
        Arc::new(Self::build(id, script, Some(gate)))
    }

    fn build(id: &str, script: Script, gate: Option<oneshot::Receiver<()>>) -> Self {
        Self {
            id: id.to_string(),
            script,
            supports_edits: true,
            gate: Mutex::new(gate),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            last_source: Mutex::new(None),
            last_instruction: Mutex::new(None),
        }
    }

    pub fn without_edits(self: Arc<Self>) -> Arc<Self> {
        let mut inner = Arc::try_unwrap(self).unwrap_or_else(|shared| {
            Self::build(&shared.id, shared.script, None)
        });
        inner.supports_edits = false;
        Arc::new(inner)
    }

    /// Deterministic image bytes produced by the provider `id`
    pub fn image_bytes(id: &str) -> Vec<u8> {
        format!("image-from-{id}").into_bytes()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn last_source(&self) -> Option<Bytes> {
        self.last_source.lock().ok().and_then(|s| s.clone())
    }

    pub fn last_instruction(&self) -> Option<String> {
        self.last_instruction.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_edits(&self) -> bool {
        self.supports_edits
    }

    async fn invoke(
        &self,
        source: Option<&SourceImage>,
        instruction: &str,
        _target: &TargetSpec,
    ) -> Result<ProviderResult, AdapterError> {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_source.lock() {
            *last = source.map(|s| s.bytes.clone());
        }
        if let Ok(mut last) = self.last_instruction.lock() {
            *last = Some(instruction.to_string());
        }

        let gate = self.gate.lock().ok().and_then(|mut g| g.take());
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        match self.script {
            Script::Succeed => Ok(ProviderResult::success(
                &self.id,
                GeneratedImage {
                    bytes: Bytes::from(Self::image_bytes(&self.id)),
                    mime_type: "image/png".into(),
                },
                started.elapsed(),
            )),
            Script::Fail(kind) => Ok(ProviderResult::failure(
                &self.id,
                ProviderFailure::new(kind, format!("{} scripted to fail", self.id)),
                started.elapsed(),
            )),
            Script::Raise => Err(AdapterError::InvalidRequest(format!(
                "{} scripted to raise",
                self.id
            ))),
            Script::Panic => panic!("{} scripted to panic", self.id),
        }
    }
}
