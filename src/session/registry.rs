//! Connection → session map.
//!
//! The lock only ever covers a map operation. Callers get an `Arc` back and the
//! lock is released before any session logic runs.

use super::{AudioSession, ConnectionId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<AudioSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a ready session under its connection.
    pub fn register(&self, connection: ConnectionId, session: Arc<AudioSession>) {
        let replaced = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, session);
        if let Some(old) = replaced {
            warn!(connection = %connection, session_id = %old.id(), "Connection re-registered, previous session detached");
        }
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<Arc<AudioSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection)
            .cloned()
    }

    /// Remove the connection. `None` means unknown or already closed.
    pub fn unregister(&self, connection: ConnectionId) -> Option<Arc<AudioSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Take every session out at once, used during shutdown.
    pub fn drain(&self) -> Vec<(ConnectionId, Arc<AudioSession>)> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}
