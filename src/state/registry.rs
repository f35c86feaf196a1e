//! Code -> session lookup
//!
//! The registry owns the mapping from normalized session code to the handle
//! of that session's lane. Creation runs under the write lock, so a code is
//! checked and claimed atomically and two live sessions never share one.

use super::code::{generate_code, parse_requested_code};
use super::lane::{spawn_lane, SessionHandle};
use super::session::Session;
use crate::broadcast::ConnectionSender;
use crate::error::SessionError;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_CODE_ATTEMPTS: u32 = 32;

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionCode, SessionHandle>>>,
    limits: SessionLimits,
    max_code_attempts: u32,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits, max_code_attempts: u32) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            limits,
            max_code_attempts,
        }
    }

    /// Create a session owned by `owner`, or resume one it already owns
    ///
    /// With no requested code a fresh code is generated. A requested code is
    /// honored when free; when it belongs to a live session of the same owner
    /// that session is returned unchanged.
    pub async fn create_session(
        &self,
        owner: &ConnectionId,
        sender: ConnectionSender,
        requested: Option<&str>,
    ) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.write().await;

        let code = match requested {
            Some(raw) => {
                let code = parse_requested_code(raw)?;
                if let Some(existing) = sessions.get(&code).filter(|h| !h.is_closed()) {
                    if existing.owner == *owner {
                        tracing::debug!(session = %code, "Owner resumed existing session");
                        return Ok(existing.clone());
                    }
                    tracing::warn!(session = %code, "Requested session code already in use");
                    return Err(SessionError::SessionCodeConflict(code.to_string()));
                }
                code
            }
            None => self.allocate_code(&sessions)?,
        };

        let session = Session::new(code.clone(), owner.clone(), sender, self.limits.clone());
        let handle = spawn_lane(session, self.clone());
        sessions.insert(code.clone(), handle.clone());

        tracing::info!(
            session = %code,
            instance = %handle.instance_id,
            active_sessions = sessions.len(),
            "Session created"
        );
        Ok(handle)
    }

    fn allocate_code(
        &self,
        sessions: &HashMap<SessionCode, SessionHandle>,
    ) -> Result<SessionCode, SessionError> {
        for _ in 0..self.max_code_attempts {
            let code = generate_code();
            let taken = sessions.get(&code).is_some_and(|h| !h.is_closed());
            if !taken {
                return Ok(code);
            }
        }

        tracing::error!(
            attempts = self.max_code_attempts,
            active_sessions = sessions.len(),
            "Could not allocate a session code"
        );
        Err(SessionError::ResourceExhausted(self.max_code_attempts))
    }

    /// Find a live session by code, ignoring case and surrounding whitespace
    pub async fn lookup(&self, raw: &str) -> Result<SessionHandle, SessionError> {
        let code = SessionCode::normalize(raw);
        self.sessions
            .read()
            .await
            .get(&code)
            .filter(|h| !h.is_closed())
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(code.to_string()))
    }

    /// Remove a session and terminate its lane; unknown codes are ignored
    pub async fn destroy(&self, raw: &str) -> bool {
        let code = SessionCode::normalize(raw);
        let removed = self.sessions.write().await.remove(&code);

        match removed {
            Some(handle) => {
                tracing::info!(session = %code, "Session destroyed");
                handle.terminate(EndReason::Destroyed);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a terminated session instance
    ///
    /// Only removes the entry if it still belongs to `instance_id`, so a
    /// stale release never evicts a newer session reusing the code.
    pub async fn release(&self, code: &SessionCode, instance_id: &SessionInstanceId) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(code)
            .is_some_and(|h| h.instance_id == *instance_id)
        {
            sessions.remove(code);
            tracing::debug!(session = %code, remaining = sessions.len(), "Session released");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionLimits::default(), DEFAULT_CODE_ATTEMPTS)
    }
}
