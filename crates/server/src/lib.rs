use std::sync::Arc;

use db::DBService;
use generation::GenerationOrchestrator;
use services::services::{
    blob_store::BlobStore,
    navigator::{EditSession, SharedSession},
};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{error::ApiError, session_registry::SessionRegistry};

pub mod error;
pub mod middleware;
pub mod routes;
pub mod session_registry;

/// Shared handles every route works with
#[derive(Clone)]
pub struct AppState {
    db: DBService,
    blobs: Arc<dyn BlobStore>,
    orchestrator: GenerationOrchestrator,
    sessions: SessionRegistry,
}

impl AppState {
    pub fn new(db: DBService, blobs: Arc<dyn BlobStore>, orchestrator: GenerationOrchestrator) -> Self {
        Self {
            db,
            blobs,
            orchestrator,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db.pool
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn orchestrator(&self) -> &GenerationOrchestrator {
        &self.orchestrator
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn insert_session(&self, session: EditSession) -> SharedSession {
        self.sessions.insert(session)
    }

    pub fn session(&self, id: Uuid) -> Result<SharedSession, ApiError> {
        self.sessions
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("Session {id} not found")))
    }

    pub fn remove_session(&self, id: Uuid) -> Option<SharedSession> {
        self.sessions.remove(id)
    }
}
