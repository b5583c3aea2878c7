//! Fixed-size session pool
//!
//! All sessions (and their engine bundles) are constructed eagerly at
//! startup; nothing is allocated on the hot path. The pool's mutex guards
//! only the free-index stack — each session carries its own lock.

use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use super::SessionContext;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ws::WsSocket;

/// Pre-initialized sessions plus the indices not currently attached.
///
/// Every index is either in the free stack or bound to exactly one
/// connection, never both.
pub struct SessionPool {
    sessions: Vec<SessionContext>,
    free: Mutex<Vec<usize>>,
}

impl SessionPool {
    /// Construct and initialize `max_sessions` sessions.
    pub fn init(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut sessions = Vec::with_capacity(config.max_sessions);
        let mut free = Vec::with_capacity(config.max_sessions);
        for idx in 0..config.max_sessions {
            let session = SessionContext::init(config).map_err(|err| {
                error!(session = idx, error = %err, "failed to init session");
                err
            })?;
            sessions.push(session);
            free.push(idx);
        }
        Ok(Self {
            sessions,
            free: Mutex::new(free),
        })
    }

    /// Pop a free session, reset it, and attach the socket. `None` when the
    /// pool is exhausted or the reset fails.
    pub fn acquire(&self, socket: Arc<WsSocket>) -> Option<usize> {
        let idx = self.free.lock().unwrap().pop()?;
        if let Err(err) = self.sessions[idx].reset_for_reuse() {
            warn!(session = idx, error = %err, "session reset failed during acquire");
            self.free.lock().unwrap().push(idx);
            return None;
        }
        self.sessions[idx].start(socket);
        Some(idx)
    }

    /// Detach a session and return its index to the free stack.
    pub fn release(&self, idx: usize) {
        if idx >= self.sessions.len() {
            return;
        }
        self.sessions[idx].stop();
        self.free.lock().unwrap().push(idx);
    }

    pub fn get(&self, idx: usize) -> &SessionContext {
        &self.sessions[idx]
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently in the free stack.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
