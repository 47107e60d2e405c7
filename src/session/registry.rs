//! Registry of live sessions

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{Session, State};

#[derive(Debug)]
struct Entry {
    session: Arc<Session>,
    connected_at: DateTime<Utc>,
}

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub state: State,
    pub connected_at: DateTime<Utc>,
}

/// Process-wide collection of connected sessions
///
/// Only touched on connect, disconnect, listing and shutdown; never on the
/// per-frame path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Entry>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly connected session
    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id();
        let entry = Entry {
            session,
            connected_at: Utc::now(),
        };
        let total = {
            let mut sessions = self.lock();
            sessions.insert(id, entry);
            sessions.len()
        };
        tracing::debug!(session_id = %id, total, "session registered");
    }

    /// Stop tracking a session
    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        let removed = self.lock().remove(&id).map(|entry| entry.session);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session deregistered");
        }
        removed
    }

    /// Get a session by ID
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.lock().get(&id).map(|entry| Arc::clone(&entry.session))
    }

    /// Summaries of every live session, oldest first
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .lock()
            .values()
            .map(|entry| SessionSummary {
                id: entry.session.id(),
                state: entry.session.state(),
                connected_at: entry.connected_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no sessions are connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every session, used on shutdown
    ///
    /// The lock is released before any session is closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .lock()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();

        let closed = sessions.len();
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;
        if closed > 0 {
            tracing::info!(closed, "closed all sessions");
        }
        closed
    }
}
