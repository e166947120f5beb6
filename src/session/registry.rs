//! Process-wide session registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::events::SessionEvent;
use super::machine::{SessionMachine, SessionServices};
use super::types::{NewSession, Session, SessionSummary};
use crate::{Error, Result};

/// Arena of live sessions keyed by id
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionMachine>>>,
    services: Arc<SessionServices>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(services: SessionServices) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            services: Arc::new(services),
        }
    }

    #[must_use]
    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Create, persist and register a session
    ///
    /// Interactive sessions start calibrating; passive ones are active
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the request is invalid or persistence fails
    pub async fn create(&self, request: NewSession) -> Result<Arc<SessionMachine>> {
        if request.story_id.trim().is_empty() || request.parent_id.trim().is_empty() {
            return Err(Error::Protocol(
                "storyId and parentId are required".to_string(),
            ));
        }

        let session = Session::new(request);
        self.services.store.create(&session)?;

        let mode = session.mode;
        let machine = Arc::new(SessionMachine::new(session, Arc::clone(&self.services))?);
        machine.emit(SessionEvent::Created { mode });

        tracing::info!(session_id = %machine.id(), mode = %mode, status = %machine.status(), "session created");
        self.sessions
            .write()
            .await
            .insert(machine.id().to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    /// Live session, restoring a non-terminal one from the store
    ///
    /// # Errors
    ///
    /// Returns error if the store lookup fails
    pub async fn get(&self, id: &str) -> Result<Option<Arc<SessionMachine>>> {
        let live = self.sessions.read().await.get(id).cloned();
        if let Some(machine) = live {
            if !machine.status().is_terminal() {
                return Ok(Some(machine));
            }
            self.sessions.write().await.remove(id);
            return Ok(None);
        }

        let Some(session) = self.services.store.get(id)? else {
            return Ok(None);
        };
        if session.status.is_terminal() {
            return Ok(None);
        }

        let mut sessions = self.sessions.write().await;
        // another caller may have restored it meanwhile
        if let Some(machine) = sessions.get(id) {
            return Ok(Some(Arc::clone(machine)));
        }
        let machine = Arc::new(SessionMachine::new(session, Arc::clone(&self.services))?);
        tracing::info!(session_id = %id, status = %machine.status(), "session restored from store");
        sessions.insert(id.to_string(), Arc::clone(&machine));
        Ok(Some(machine))
    }

    /// Finalize and evict a session
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] for unknown ids, or the
    /// transition error if it already ended
    pub async fn end_session(&self, id: &str) -> Result<SessionSummary> {
        let machine = self
            .get(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let summary = machine.end().await;
        self.sessions.write().await.remove(id);
        summary
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// End sessions that have had no connection for longer than `ttl`
    ///
    /// Terminal sessions are evicted as well. Returns how many sessions were
    /// removed.
    pub async fn reap_orphans(&self, ttl: Duration) -> usize {
        let candidates: Vec<Arc<SessionMachine>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|m| {
                m.status().is_terminal() || m.detached_for().is_some_and(|idle| idle >= ttl)
            })
            .cloned()
            .collect();

        for machine in &candidates {
            if !machine.status().is_terminal() {
                tracing::info!(session_id = %machine.id(), "ending orphaned session");
                if let Err(e) = machine.end().await {
                    tracing::warn!(session_id = %machine.id(), error = %e, "failed to end orphaned session");
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        for machine in &candidates {
            sessions.remove(machine.id());
        }
        candidates.len()
    }

    /// End every live session
    pub async fn shutdown(&self) {
        let machines: Vec<Arc<SessionMachine>> =
            self.sessions.write().await.drain().map(|(_, m)| m).collect();

        tracing::info!(count = machines.len(), "draining sessions");
        for machine in machines {
            let _ = machine.interrupt_ai();
            if machine.status().is_terminal() {
                continue;
            }
            if let Err(e) = machine.end().await {
                tracing::warn!(session_id = %machine.id(), error = %e, "failed to end session on shutdown");
            }
        }
    }
}
