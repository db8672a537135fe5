//! Local session registry
//!
//! Per-process map from user identity to live connection. Answers "is
//! this user connected here"; it is not a global presence directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::Connection;
use crate::types::{ConnectionId, UserId};

/// Identity → connection map shared by every task of one server
///
/// A single mutex guards the map; it is never held across an await.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, Arc<Connection>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Arc<Connection>>> {
        // Entries are single inserts/removes, so a poisoned map is still consistent
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the entry for `user`
    ///
    /// Returns the displaced connection; closing it is the caller's job.
    pub fn put(&self, user: UserId, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.lock().insert(user, conn)
    }

    pub fn get(&self, user: &UserId) -> Option<Arc<Connection>> {
        self.lock().get(user).cloned()
    }

    pub fn remove(&self, user: &UserId) -> Option<Arc<Connection>> {
        self.lock().remove(user)
    }

    /// Remove the entry only if it still belongs to connection `id`
    pub fn remove_connection(&self, user: &UserId, id: ConnectionId) -> bool {
        let mut sessions = self.lock();
        match sessions.get(user) {
            Some(conn) if conn.id() == id => {
                sessions.remove(user);
                true
            }
            _ => false,
        }
    }

    /// Every registered connection at this instant
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
