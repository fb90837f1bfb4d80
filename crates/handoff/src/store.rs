use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::trace;
use uuid::Uuid;

use crate::error::{HandoffError, Result};
use crate::secret::Secret;

/// Opaque, random identifier for one handoff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| HandoffError::InvalidSessionId(s.to_string()))
    }
}

/// Keyed, single-read secret cache.
///
/// `take` removes the entry, so at most one caller ever receives a given
/// secret. Nothing is persisted.
#[derive(Default)]
pub struct HandoffStore {
    entries: Mutex<HashMap<SessionId, Secret>>,
}

impl HandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `secret` under a fresh session id.
    pub fn put(&self, secret: Secret) -> SessionId {
        let mut entries = self.entries();
        loop {
            let id = SessionId::generate();
            if let Entry::Vacant(slot) = entries.entry(id) {
                slot.insert(secret);
                trace!(pending = entries.len(), "handoff entry created");
                return id;
            }
        }
    }

    /// Remove and return the secret for `id`.
    pub fn take(&self, id: &SessionId) -> Result<Secret> {
        let secret = self.entries().remove(id).ok_or(HandoffError::NotFound)?;
        trace!("handoff entry consumed");
        Ok(secret)
    }

    /// Drop the entry for `id` if it is still present.
    pub fn purge(&self, id: &SessionId) {
        if self.entries().remove(id).is_some() {
            trace!("handoff entry purged");
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionId, Secret>> {
        // The map is consistent after every operation, so a panic elsewhere
        // while holding the lock does not invalidate it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HandoffStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffStore")
            .field("pending", &self.len())
            .finish()
    }
}

/// The process-wide store shared by all transports.
pub fn store() -> &'static HandoffStore {
    static STORE: OnceLock<HandoffStore> = OnceLock::new();
    STORE.get_or_init(HandoffStore::new)
}
