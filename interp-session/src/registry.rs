use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::session::InterpreterSession;

/// A fixed set of interpreter sessions handed out to callers by id.
///
/// There is no waiting list: when every session is taken, `acquire` returns
/// `None` and the caller tries again later.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Arc<InterpreterSession>>,
}

impl SessionRegistry {
    /// Starts `size` sessions from `config`. If one fails to start, the ones
    /// already running are closed before the error is returned.
    pub async fn start(config: &SessionConfig, size: usize) -> Result<Self, SessionError> {
        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            match InterpreterSession::create(config.clone()).await {
                Ok(session) => sessions.push(Arc::new(session)),
                Err(err) => {
                    Self { sessions }.shutdown().await;
                    return Err(err);
                }
            }
        }
        debug!("started {size} interpreter session(s)");
        Ok(Self { sessions })
    }

    pub fn from_sessions(sessions: Vec<Arc<InterpreterSession>>) -> Self {
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| !session.is_locked())
            .count()
    }

    /// The session already locked for `caller_id`, or else the first free one,
    /// now locked for it.
    pub fn acquire(&self, caller_id: &str) -> Option<Arc<InterpreterSession>> {
        if let Some(session) = self.session_for(caller_id) {
            return Some(session);
        }
        self.sessions
            .iter()
            .find(|session| session.try_lock(caller_id))
            .cloned()
    }

    pub fn session_for(&self, caller_id: &str) -> Option<Arc<InterpreterSession>> {
        self.sessions
            .iter()
            .find(|session| session.lock_holder().as_deref() == Some(caller_id))
            .cloned()
    }

    /// Unlocks the session held by `caller_id`. `Ok(false)` if it held none.
    pub fn release(&self, caller_id: &str) -> Result<bool, SessionError> {
        match self.session_for(caller_id) {
            Some(session) => session.unlock(caller_id).map(|()| true),
            None => Ok(false),
        }
    }

    /// Frees and closes every session.
    pub async fn shutdown(&self) {
        for session in &self.sessions {
            session.force_unlock();
            if let Err(err) = session.close().await {
                warn!("failed to close interpreter session: {err}");
            }
        }
    }
}
