//! Live editing sessions keyed by id.
//!
//! Sessions only live in memory and hold their pending batch results, image
//! bytes included, so callers that walk away without closing a session must
//! not keep it alive forever. Every lookup marks a session as used, and a
//! background sweep drops sessions that have sat idle past the configured
//! timeout.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use services::services::navigator::{EditSession, SharedSession};
use tokio::{task::JoinHandle, time::Instant};
use uuid::Uuid;

const SESSION_IDLE_ENV: &str = "SESSION_IDLE_SECS";
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle timeout from `SESSION_IDLE_SECS`, falling back to thirty minutes.
pub fn session_idle_timeout() -> Duration {
    std::env::var(SESSION_IDLE_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_IDLE)
}

struct SessionEntry {
    session: SharedSession,
    last_touched: Instant,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<DashMap<Uuid, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: EditSession) -> SharedSession {
        let id = session.id();
        let shared = Arc::new(tokio::sync::Mutex::new(session));
        self.entries.insert(
            id,
            SessionEntry {
                session: Arc::clone(&shared),
                last_touched: Instant::now(),
            },
        );
        shared
    }

    /// Looks up a session and marks it as used.
    pub fn get(&self, id: Uuid) -> Option<SharedSession> {
        let mut entry = self.entries.get_mut(&id)?;
        entry.last_touched = Instant::now();
        Some(Arc::clone(&entry.session))
    }

    pub fn remove(&self, id: Uuid) -> Option<SharedSession> {
        self.entries.remove(&id).map(|(_, entry)| entry.session)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every session untouched for at least `max_idle` and returns how
    /// many went. A session locked by an in-flight request is kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.entries.retain(|id, entry| {
            let idle = now.saturating_duration_since(entry.last_touched);
            if idle < max_idle || entry.session.try_lock().is_err() {
                return true;
            }
            tracing::debug!(session_id = %id, idle_secs = idle.as_secs(), "Evicting idle session");
            evicted += 1;
            false
        });
        evicted
    }

    /// Spawns the background sweep that runs [`Self::evict_idle`] every `every`.
    pub fn spawn_sweeper(&self, max_idle: Duration, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = registry.evict_idle(max_idle);
                if evicted > 0 {
                    tracing::info!("Evicted {} idle editing sessions", evicted);
                }
            }
        })
    }
}
