//! Session Manager for multi-session orchestration
//!
//! Registry of named sessions. Creation and deletion take the registry write
//! lock for the duration of the check-and-mutate step only, so two concurrent
//! starts of the same name resolve to exactly one session and one
//! `DuplicateSession` error. Engine startup happens on the session worker,
//! outside the lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{SessionConfig, SessionName, SessionStatus};
use super::whatsapp::WhatsappSession;
use crate::engine::EngineFactory;
use crate::error::{Error, Result};

/// Manages every session of the process.
///
/// Construct one explicitly and share it (`Arc<SessionManager>`) with every
/// consumer. It starts with an empty registry; [`SessionManager::shutdown`]
/// stops and removes every session.
pub struct SessionManager {
    /// Map of session name to live session handle
    sessions: RwLock<HashMap<SessionName, WhatsappSession>>,
    /// Creates one engine per started session
    engines: Arc<dyn EngineFactory>,
}

impl SessionManager {
    /// Create a manager with an empty registry
    pub fn new(engines: Arc<dyn EngineFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            engines,
        }
    }

    /// Register and start a session.
    ///
    /// Returns as soon as the session is registered in STARTING; engine
    /// startup and authentication continue in the background.
    pub async fn start_session(&self, name: &str, config: SessionConfig) -> Result<WhatsappSession> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("session name must not be empty".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(Error::DuplicateSession(name.to_string()));
        }

        let engine = self.engines.create(name, &config)?;
        info!(session = %name, engine = engine.name(), "Starting session");
        let session = WhatsappSession::spawn(name, config, engine);
        sessions.insert(name.to_string(), session.clone());

        Ok(session)
    }

    /// Live handle of a session
    pub async fn get_session(&self, name: &str) -> Result<WhatsappSession> {
        let sessions = self.sessions.read().await;
        sessions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))
    }

    /// Stop a session and release its engine. Idempotent; the entry stays registered.
    pub async fn stop_session(&self, name: &str) -> Result<()> {
        let session = self.get_session(name).await?;
        session.stop().await;
        info!(session = %name, "Stopped session");
        Ok(())
    }

    /// Remove a STOPPED session from the registry
    pub async fn delete_session(&self, name: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let status = sessions
            .get(name)
            .map(|s| s.status())
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;

        if status != SessionStatus::Stopped {
            return Err(Error::SessionNotInStoppedState {
                name: name.to_string(),
                actual: status,
            });
        }

        sessions.remove(name);
        debug!(session = %name, "Removed session from registry");
        Ok(())
    }

    /// Stop, remove and start a session again with the config it was started with
    pub async fn restart_session(&self, name: &str) -> Result<WhatsappSession> {
        let session = self.get_session(name).await?;
        let config = session.config().clone();
        session.stop().await;

        {
            let mut sessions = self.sessions.write().await;
            // A concurrent restart may already have replaced the entry
            if sessions.get(name).is_some_and(|s| s.status() == SessionStatus::Stopped) {
                sessions.remove(name);
            }
        }

        self.start_session(name, config).await
    }

    /// Registered session names
    pub async fn list_sessions(&self) -> Vec<SessionName> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }

    /// Handles of every registered session
    pub async fn sessions(&self) -> Vec<WhatsappSession> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    /// Check if a session exists
    pub async fn has_session(&self, name: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(name)
    }

    /// Get the number of registered sessions
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Stop all sessions concurrently
    pub async fn stop_all(&self) {
        let sessions = self.sessions().await;
        join_all(sessions.iter().map(|s| s.stop())).await;
    }

    /// Stop every session and empty the registry
    pub async fn shutdown(&self) {
        self.stop_all().await;
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        info!(count, "Session manager shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // No async drop: dropping the handles closes each worker's command
        // channel and the workers stop their engines on their own
        debug!("SessionManager dropping");
    }
}
