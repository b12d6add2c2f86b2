//! Concurrent registry of live connections keyed by their [`Sid`].
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use sockwire_engine_core::Sid;

/// A concurrent map from session id to a shared connection object.
///
/// Every accessor clones the `Arc` out of the map so no lock is held by callers.
#[derive(Debug)]
pub struct SessionRegistry<T> {
    sessions: RwLock<HashMap<Sid, Arc<T>>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> SessionRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, replacing any previous one with the same id.
    pub fn insert(&self, sid: Sid, value: Arc<T>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid, value);
    }

    /// Get a connection by its id
    pub fn get(&self, sid: &Sid) -> Option<Arc<T>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
    }

    /// Remove a connection and return it if it was present
    pub fn remove(&self, sid: &Sid) -> Option<Arc<T>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sid)
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all the connections
    pub fn all(&self) -> Vec<Arc<T>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
