//! Cursor-driven editing over one lineage chain.
//!
//! A session walks a chain loaded from the lineage store, launches generation
//! batches against the version under the cursor, and commits at most one
//! provider result per batch back into the store.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use db::models::artifact::{
    Artifact, ArtifactType, CreateRootArtifact, ForkArtifact, LineageError, NewVersion,
};
use generation::{
    GenerationRequest, ProviderResult, ProviderStatus, SourceContent, SourceImage, TargetSpec,
    provider::ProviderFailure,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::blob_store::{BlobStore, BlobStoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Generating,
    ResultsReady,
    Committed,
    Discarded,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Generating => write!(f, "generating"),
            SessionState::ResultsReady => write!(f, "results_ready"),
            SessionState::Committed => write!(f, "committed"),
            SessionState::Discarded => write!(f, "discarded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error(transparent)]
    Lineage(#[from] LineageError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Session has no artifact to work on")]
    NoArtifact,
    #[error("Cursor {index} is outside a chain of {len} versions")]
    CursorOutOfRange { index: usize, len: usize },
    #[error("Artifact {0} is not part of this session's chain")]
    NotInChain(Uuid),
    #[error("Artifact {0} is a root version and has no edit to regenerate")]
    NothingToRegenerate(Uuid),
    #[error("Batch {0} has been superseded")]
    StaleBatch(Uuid),
    #[error("Cannot {action} while the session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },
    #[error("Provider {0} has no result in this batch")]
    ResultMissing(String),
    #[error("Provider {provider_id} produced no image: {failure}")]
    ProviderFailed {
        provider_id: String,
        failure: ProviderFailure,
    },
    #[error("Provider {provider_id} returned {mime_type} content, which cannot join this lineage")]
    UnsupportedContent {
        provider_id: String,
        mime_type: String,
    },
}

/// What committing a batch result will do
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchIntent {
    /// Prompt-only; commits a new root
    Generate,
    /// Edit of `base_id`; commits a conflict-checked append at the tip or a
    /// branch anywhere else
    Edit { base_id: Uuid, at_tip: bool },
    /// Re-run of `current_id`'s instruction against its parent; commits a sibling
    Regenerate { current_id: Uuid, parent_id: Uuid },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Extend the lineage
    #[default]
    Save,
    /// Fork into an independent lineage
    SaveAsNew,
}

/// Everything needed to launch a batch
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub batch_id: Uuid,
    pub intent: BatchIntent,
    pub instruction: String,
    pub source: Option<Artifact>,
}

impl BatchPlan {
    /// Loads the source bytes and shapes the orchestrator request.
    pub async fn to_request(
        &self,
        blobs: &dyn BlobStore,
        provider_ids: Vec<String>,
        target: TargetSpec,
    ) -> Result<GenerationRequest, NavigatorError> {
        let source = match &self.source {
            None => SourceContent::Prompt {
                prompt: self.instruction.clone(),
            },
            Some(artifact) => SourceContent::Edit {
                image: SourceImage {
                    bytes: blobs.get(&artifact.content.content_locator).await?,
                    mime_type: artifact.content.mime_type.clone(),
                },
                instruction: self.instruction.clone(),
            },
        };
        Ok(GenerationRequest {
            provider_ids,
            source,
            target,
        })
    }
}

#[derive(Debug, Clone)]
struct PendingBatch {
    batch_id: Uuid,
    intent: BatchIntent,
    instruction: String,
    results: BTreeMap<String, ProviderResult>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    pub provider_id: String,
    pub status: ProviderStatus,
    pub elapsed_ms: u64,
    #[ts(optional)]
    pub error: Option<ProviderFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    pub intent: BatchIntent,
    pub instruction: String,
    pub results: Vec<ResultSnapshot>,
    #[ts(type = "Date")]
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub cursor: Option<usize>,
    pub chain: Vec<Artifact>,
    #[ts(optional)]
    pub batch: Option<BatchSnapshot>,
}

/// One caller's editing session over a lineage chain
#[derive(Debug, Clone)]
pub struct EditSession {
    id: Uuid,
    chain: Vec<Artifact>,
    cursor: usize,
    state: SessionState,
    pending: Option<PendingBatch>,
}

impl Default for EditSession {
    fn default() -> Self {
        Self::new()
    }
}

impl EditSession {
    /// A session with nothing loaded; its first batch generates from a prompt.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            chain: Vec::new(),
            cursor: 0,
            state: SessionState::Idle,
            pending: None,
        }
    }

    /// Opens the chain ending at `leaf_id` with the cursor on the leaf.
    pub async fn open(pool: &SqlitePool, leaf_id: Uuid) -> Result<Self, NavigatorError> {
        let chain = Artifact::get_chain(pool, leaf_id).await?;
        let mut session = Self::new();
        session.load_chain(chain);
        Ok(session)
    }

    fn load_chain(&mut self, chain: Vec<Artifact>) {
        self.cursor = chain.len().saturating_sub(1);
        self.chain = chain;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chain(&self) -> &[Artifact] {
        &self.chain
    }

    pub fn cursor(&self) -> Option<usize> {
        (!self.chain.is_empty()).then_some(self.cursor)
    }

    pub fn current(&self) -> Option<&Artifact> {
        self.chain.get(self.cursor)
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        self.pending.as_ref().map(|p| p.batch_id)
    }

    pub fn move_cursor(&mut self, index: usize) -> Result<&Artifact, NavigatorError> {
        if index >= self.chain.len() {
            return Err(NavigatorError::CursorOutOfRange {
                index,
                len: self.chain.len(),
            });
        }
        self.cursor = index;
        Ok(&self.chain[index])
    }

    pub fn select(&mut self, artifact_id: Uuid) -> Result<&Artifact, NavigatorError> {
        let index = self
            .chain
            .iter()
            .position(|a| a.id == artifact_id)
            .ok_or(NavigatorError::NotInChain(artifact_id))?;
        self.move_cursor(index)
    }

    /// Starts a batch applying `instruction` to the version under the cursor,
    /// superseding any batch in flight.
    pub fn begin_edit(&mut self, instruction: &str) -> BatchPlan {
        let (intent, source) = match self.current() {
            None => (BatchIntent::Generate, None),
            Some(base) => (
                BatchIntent::Edit {
                    base_id: base.id,
                    at_tip: self.cursor + 1 == self.chain.len(),
                },
                Some(base.clone()),
            ),
        };
        self.start_batch(intent, instruction.to_string(), source)
    }

    /// Starts a batch re-running the current version's own instruction on its parent.
    pub fn begin_regenerate(&mut self) -> Result<BatchPlan, NavigatorError> {
        let current = self.current().ok_or(NavigatorError::NoArtifact)?;
        let (Some(parent_id), Some(edit)) = (current.parent_artifact_id, current.last_edit()) else {
            return Err(NavigatorError::NothingToRegenerate(current.id));
        };
        let intent = BatchIntent::Regenerate {
            current_id: current.id,
            parent_id,
        };
        let instruction = edit.instruction.clone();
        // The parent of chain[cursor] is chain[cursor - 1]
        let parent = self
            .cursor
            .checked_sub(1)
            .and_then(|i| self.chain.get(i))
            .filter(|p| p.id == parent_id)
            .cloned()
            .ok_or(NavigatorError::NotInChain(parent_id))?;
        Ok(self.start_batch(intent, instruction, Some(parent)))
    }

    fn start_batch(
        &mut self,
        intent: BatchIntent,
        instruction: String,
        source: Option<Artifact>,
    ) -> BatchPlan {
        if let Some(stale) = &self.pending {
            tracing::debug!(session_id = %self.id, batch_id = %stale.batch_id, "Superseding batch");
        }
        let batch_id = Uuid::new_v4();
        self.pending = Some(PendingBatch {
            batch_id,
            intent: intent.clone(),
            instruction: instruction.clone(),
            results: BTreeMap::new(),
            started_at: Utc::now(),
        });
        self.state = SessionState::Generating;
        BatchPlan {
            batch_id,
            intent,
            instruction,
            source,
        }
    }

    fn pending_for(&mut self, batch_id: Uuid) -> Result<&mut PendingBatch, NavigatorError> {
        match self.pending.as_mut() {
            Some(pending) if pending.batch_id == batch_id => Ok(pending),
            _ => Err(NavigatorError::StaleBatch(batch_id)),
        }
    }

    /// Records one provider result; results for superseded batches are refused.
    pub fn record_result(&mut self, batch_id: Uuid, result: ProviderResult) -> Result<(), NavigatorError> {
        if self.state != SessionState::Generating {
            return Err(NavigatorError::InvalidTransition {
                action: "record a result",
                state: self.state,
            });
        }
        let pending = self.pending_for(batch_id)?;
        pending.results.insert(result.provider_id.clone(), result);
        Ok(())
    }

    pub fn finish_batch(&mut self, batch_id: Uuid) -> Result<(), NavigatorError> {
        self.pending_for(batch_id)?;
        if self.state != SessionState::Generating {
            return Err(NavigatorError::InvalidTransition {
                action: "finish a batch",
                state: self.state,
            });
        }
        self.state = SessionState::ResultsReady;
        Ok(())
    }

    /// Withdraws a batch that never launched, returning the session to idle.
    pub fn abort_batch(&mut self, batch_id: Uuid) -> Result<(), NavigatorError> {
        self.pending_for(batch_id)?;
        self.pending = None;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Persists `provider_id`'s image from the ready batch.
    pub async fn commit(
        &mut self,
        pool: &SqlitePool,
        blobs: &dyn BlobStore,
        batch_id: Uuid,
        provider_id: &str,
        mode: CommitMode,
    ) -> Result<Artifact, NavigatorError> {
        if self.state != SessionState::ResultsReady {
            return Err(NavigatorError::InvalidTransition {
                action: "commit",
                state: self.state,
            });
        }
        // Every version in a lineage shares the root's type
        let lineage_type = self.chain.first().map(|a| a.artifact_type);
        let pending = self.pending_for(batch_id)?;
        let result = pending
            .results
            .get(provider_id)
            .ok_or_else(|| NavigatorError::ResultMissing(provider_id.to_string()))?;
        let image = match (result.image(), result.failure_reason()) {
            (Some(image), _) => image.clone(),
            (None, Some(failure)) => {
                return Err(NavigatorError::ProviderFailed {
                    provider_id: provider_id.to_string(),
                    failure: failure.clone(),
                });
            }
            (None, None) => return Err(NavigatorError::ResultMissing(provider_id.to_string())),
        };
        let artifact_type = ArtifactType::from_mime_type(&image.mime_type)
            .filter(|t| lineage_type.is_none_or(|expected| expected == *t))
            .ok_or_else(|| NavigatorError::UnsupportedContent {
                provider_id: provider_id.to_string(),
                mime_type: image.mime_type.clone(),
            })?;
        let intent = pending.intent.clone();
        let version = NewVersion {
            content: blobs.put(&image.bytes).await?.into_content_ref(image.mime_type),
            instruction: pending.instruction.clone(),
            provider_id: Some(provider_id.to_string()),
        };

        let committed = match (&intent, mode) {
            (BatchIntent::Generate, _) => {
                Artifact::create_root(
                    pool,
                    &CreateRootArtifact {
                        artifact_type,
                        content: version.content,
                    },
                )
                .await?
            }
            (BatchIntent::Edit { base_id, .. }, CommitMode::SaveAsNew)
            | (BatchIntent::Regenerate { parent_id: base_id, .. }, CommitMode::SaveAsNew) => {
                Artifact::fork(
                    pool,
                    *base_id,
                    &ForkArtifact {
                        content: Some(version.content),
                    },
                )
                .await?
            }
            (BatchIntent::Edit { base_id, at_tip: true }, CommitMode::Save) => {
                Artifact::append(pool, *base_id, &version).await?
            }
            (BatchIntent::Edit { base_id, at_tip: false }, CommitMode::Save) => {
                Artifact::branch(pool, *base_id, &version).await?
            }
            (BatchIntent::Regenerate { parent_id, .. }, CommitMode::Save) => {
                Artifact::branch(pool, *parent_id, &version).await?
            }
        };

        let chain = Artifact::get_chain(pool, committed.id).await?;
        self.load_chain(chain);
        self.pending = None;
        self.state = SessionState::Committed;

        tracing::info!(
            session_id = %self.id,
            artifact_id = %committed.id,
            version = committed.version,
            provider_id = %provider_id,
            "Committed batch result"
        );
        Ok(committed)
    }

    pub fn discard(&mut self) -> Result<(), NavigatorError> {
        match self.state {
            SessionState::Generating | SessionState::ResultsReady => {
                self.pending = None;
                self.state = SessionState::Discarded;
                Ok(())
            }
            state => Err(NavigatorError::InvalidTransition {
                action: "discard",
                state,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state,
            cursor: self.cursor(),
            chain: self.chain.clone(),
            batch: self.pending.as_ref().map(|p| BatchSnapshot {
                batch_id: p.batch_id,
                intent: p.intent.clone(),
                instruction: p.instruction.clone(),
                results: p
                    .results
                    .values()
                    .map(|r| ResultSnapshot {
                        provider_id: r.provider_id.clone(),
                        status: r.status(),
                        elapsed_ms: r.elapsed_ms(),
                        error: r.failure_reason().cloned(),
                    })
                    .collect(),
                started_at: p.started_at,
            }),
        }
    }
}

/// Shared handle used by servers that keep sessions across requests
pub type SharedSession = Arc<tokio::sync::Mutex<EditSession>>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use db::{DBService, models::artifact::LineageKind};
    use generation::{FailureKind, GeneratedImage, provider::ProviderFailure};

    use super::*;
    use crate::services::blob_store::MemoryBlobStore;

    async fn setup() -> (SqlitePool, MemoryBlobStore) {
        let db = DBService::new_in_memory().await.unwrap();
        (db.pool, MemoryBlobStore::new())
    }

    async fn upload_root(pool: &SqlitePool, blobs: &MemoryBlobStore, bytes: &[u8]) -> Artifact {
        let content = blobs.put(bytes).await.unwrap().into_content_ref("image/png");
        Artifact::create_root(
            pool,
            &CreateRootArtifact {
                artifact_type: ArtifactType::Image,
                content,
            },
        )
        .await
        .unwrap()
    }

    fn media_result(provider_id: &str, bytes: &'static [u8], mime_type: &str) -> ProviderResult {
        ProviderResult::success(
            provider_id,
            GeneratedImage {
                bytes: Bytes::from_static(bytes),
                mime_type: mime_type.into(),
            },
            Duration::from_millis(40),
        )
    }

    fn image_result(provider_id: &str, bytes: &'static [u8]) -> ProviderResult {
        media_result(provider_id, bytes, "image/png")
    }

    /// Run a batch to ResultsReady with one successful result and commit it.
    async fn apply(
        session: &mut EditSession,
        plan: BatchPlan,
        pool: &SqlitePool,
        blobs: &MemoryBlobStore,
        bytes: &'static [u8],
    ) -> Artifact {
        session.record_result(plan.batch_id, image_result("sdxl", bytes)).unwrap();
        session.finish_batch(plan.batch_id).unwrap();
        session
            .commit(pool, blobs, plan.batch_id, "sdxl", CommitMode::Save)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn edit_edit_regenerate_scenario() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let plan = session.begin_edit("add hat");
        assert_eq!(plan.intent, BatchIntent::Edit { base_id: v1.id, at_tip: true });
        let v2 = apply(&mut session, plan, &pool, &blobs, b"v2").await;

        let plan = session.begin_edit("darker");
        let v3 = apply(&mut session, plan, &pool, &blobs, b"v3").await;
        assert_eq!(session.current().map(|a| a.id), Some(v3.id));

        let plan = session.begin_regenerate().unwrap();
        assert_eq!(plan.instruction, "darker");
        assert_eq!(plan.source.as_ref().map(|a| a.id), Some(v2.id));
        let v4 = apply(&mut session, plan, &pool, &blobs, b"v4").await;

        assert_eq!(v4.version, 3);
        assert_eq!(v4.parent_artifact_id, Some(v2.id));
        assert_eq!(v4.lineage_kind, LineageKind::Branch);
        assert_eq!(v4.last_edit().map(|e| e.instruction.as_str()), Some("darker"));

        let ids = |chain: Vec<Artifact>| chain.into_iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(Artifact::get_chain(&pool, v4.id).await.unwrap()), vec![v1.id, v2.id, v4.id]);
        assert_eq!(ids(Artifact::get_chain(&pool, v3.id).await.unwrap()), vec![v1.id, v2.id, v3.id]);
        assert_eq!(session.chain().iter().map(|a| a.id).collect::<Vec<_>>(), vec![v1.id, v2.id, v4.id]);
        assert_eq!(blobs.get(&v4.content.content_locator).await.unwrap().as_ref(), b"v4");
    }

    #[tokio::test]
    async fn edit_source_bytes_come_from_the_cursor_version() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"original pixels").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let plan = session.begin_edit("add hat");
        let request = plan
            .to_request(&blobs, vec!["sdxl".into()], TargetSpec::default())
            .await
            .unwrap();
        assert_eq!(request.source.instruction(), "add hat");
        assert_eq!(
            request.source.image().map(|i| i.bytes.as_ref()),
            Some(&b"original pixels"[..])
        );
    }

    #[tokio::test]
    async fn editing_a_non_tip_version_branches() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();
        let plan = session.begin_edit("add hat");
        let v2 = apply(&mut session, plan, &pool, &blobs, b"v2").await;

        session.select(v1.id).unwrap();
        let plan = session.begin_edit("sepia");
        assert_eq!(plan.intent, BatchIntent::Edit { base_id: v1.id, at_tip: false });
        let sibling = apply(&mut session, plan, &pool, &blobs, b"sepia").await;

        assert_eq!(sibling.parent_artifact_id, Some(v1.id));
        assert_eq!(sibling.version, 2);
        assert_eq!(sibling.lineage_kind, LineageKind::Branch);
        let children = Artifact::children(&pool, v1.id).await.unwrap();
        assert_eq!(children.iter().map(|a| a.id).collect::<Vec<_>>(), vec![v2.id, sibling.id]);
    }

    #[tokio::test]
    async fn regenerating_a_root_is_rejected() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        assert!(matches!(
            session.begin_regenerate(),
            Err(NavigatorError::NothingToRegenerate(id)) if id == v1.id
        ));
        assert_eq!(session.state(), SessionState::Idle);

        let mut empty = EditSession::new();
        assert!(matches!(empty.begin_regenerate(), Err(NavigatorError::NoArtifact)));
    }

    #[tokio::test]
    async fn at_most_one_commit_per_batch() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let plan = session.begin_edit("add hat");
        session.record_result(plan.batch_id, image_result("a", b"a")).unwrap();
        session.record_result(plan.batch_id, image_result("b", b"b")).unwrap();

        assert!(matches!(
            session.commit(&pool, &blobs, plan.batch_id, "a", CommitMode::Save).await,
            Err(NavigatorError::InvalidTransition { state: SessionState::Generating, .. })
        ));

        session.finish_batch(plan.batch_id).unwrap();
        session
            .commit(&pool, &blobs, plan.batch_id, "a", CommitMode::Save)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Committed);

        assert!(matches!(
            session.commit(&pool, &blobs, plan.batch_id, "b", CommitMode::Save).await,
            Err(NavigatorError::InvalidTransition { state: SessionState::Committed, .. })
        ));
        assert_eq!(Artifact::children(&pool, v1.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_or_absent_results_cannot_be_committed() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let plan = session.begin_edit("add hat");
        session
            .record_result(
                plan.batch_id,
                ProviderResult::failure(
                    "limited",
                    ProviderFailure::new(FailureKind::RateLimited, "slow down"),
                    Duration::from_millis(5),
                ),
            )
            .unwrap();
        session.finish_batch(plan.batch_id).unwrap();

        assert!(matches!(
            session.commit(&pool, &blobs, plan.batch_id, "limited", CommitMode::Save).await,
            Err(NavigatorError::ProviderFailed { .. })
        ));
        assert!(matches!(
            session.commit(&pool, &blobs, plan.batch_id, "never-ran", CommitMode::Save).await,
            Err(NavigatorError::ResultMissing(_))
        ));
        assert_eq!(session.state(), SessionState::ResultsReady);
    }

    #[tokio::test]
    async fn new_instruction_supersedes_stale_batch() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let stale = session.begin_edit("add hat");
        session.record_result(stale.batch_id, image_result("a", b"a")).unwrap();
        session.finish_batch(stale.batch_id).unwrap();

        let fresh = session.begin_edit("add scarf");
        assert_eq!(session.state(), SessionState::Generating);
        assert!(matches!(
            session.record_result(stale.batch_id, image_result("b", b"b")),
            Err(NavigatorError::StaleBatch(_))
        ));

        let committed = apply(&mut session, fresh, &pool, &blobs, b"scarf").await;
        assert_eq!(committed.last_edit().map(|e| e.instruction.as_str()), Some("add scarf"));
    }

    #[tokio::test]
    async fn save_as_new_forks_and_generate_creates_root() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        let plan = session.begin_edit("add hat");
        session.record_result(plan.batch_id, image_result("a", b"hat")).unwrap();
        session.finish_batch(plan.batch_id).unwrap();
        let forked = session
            .commit(&pool, &blobs, plan.batch_id, "a", CommitMode::SaveAsNew)
            .await
            .unwrap();
        assert_eq!(forked.version, 1);
        assert!(forked.parent_artifact_id.is_none());
        assert_eq!(forked.forked_from_id, Some(v1.id));
        assert_eq!(session.chain().len(), 1);
        assert!(Artifact::children(&pool, v1.id).await.unwrap().is_empty());

        let mut fresh = EditSession::new();
        let plan = fresh.begin_edit("a lighthouse at dusk");
        assert_eq!(plan.intent, BatchIntent::Generate);
        assert!(plan.source.is_none());
        let root = apply(&mut fresh, plan, &pool, &blobs, b"lighthouse").await;
        assert_eq!(root.lineage_kind, LineageKind::Root);
        assert_eq!(fresh.cursor(), Some(0));
    }

    #[tokio::test]
    async fn discard_and_cursor_bounds() {
        let (pool, blobs) = setup().await;
        let v1 = upload_root(&pool, &blobs, b"v1").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();

        assert!(matches!(
            session.discard(),
            Err(NavigatorError::InvalidTransition { state: SessionState::Idle, .. })
        ));
        let never_launched = session.begin_edit("add hat");
        session.abort_batch(never_launched.batch_id).unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        session.begin_edit("add hat");
        session.discard().unwrap();
        assert_eq!(session.state(), SessionState::Discarded);
        assert!(session.snapshot().batch.is_none());

        assert!(matches!(
            session.move_cursor(3),
            Err(NavigatorError::CursorOutOfRange { index: 3, len: 1 })
        ));
        assert!(matches!(session.select(Uuid::new_v4()), Err(NavigatorError::NotInChain(_))));
    }

    #[tokio::test]
    async fn committed_type_follows_the_result_content() {
        let (pool, blobs) = setup().await;

        let mut fresh = EditSession::new();
        let plan = fresh.begin_edit("a drone shot over cliffs");
        fresh
            .record_result(plan.batch_id, media_result("clip", b"frames", "video/mp4"))
            .unwrap();
        fresh
            .record_result(plan.batch_id, media_result("blob", b"??", "application/octet-stream"))
            .unwrap();
        fresh.finish_batch(plan.batch_id).unwrap();
        assert!(matches!(
            fresh.commit(&pool, &blobs, plan.batch_id, "blob", CommitMode::Save).await,
            Err(NavigatorError::UnsupportedContent { .. })
        ));
        let root = fresh
            .commit(&pool, &blobs, plan.batch_id, "clip", CommitMode::Save)
            .await
            .unwrap();
        assert_eq!(root.artifact_type, ArtifactType::Video);

        let v1 = upload_root(&pool, &blobs, b"still").await;
        let mut session = EditSession::open(&pool, v1.id).await.unwrap();
        let plan = session.begin_edit("animate it");
        session
            .record_result(plan.batch_id, media_result("clip", b"frames", "video/mp4"))
            .unwrap();
        session.finish_batch(plan.batch_id).unwrap();
        assert!(matches!(
            session.commit(&pool, &blobs, plan.batch_id, "clip", CommitMode::Save).await,
            Err(NavigatorError::UnsupportedContent { mime_type, .. }) if mime_type == "video/mp4"
        ));
        assert!(Artifact::children(&pool, v1.id).await.unwrap().is_empty());
        assert_eq!(session.state(), SessionState::ResultsReady);
    }
}
