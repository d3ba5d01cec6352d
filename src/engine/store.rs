//! Versioned canonical store for itinerary graphs.
//!
//! Optimistic concurrency: readers take a cheap `Arc` snapshot, writers
//! commit a whole working copy against the version they read. A commit
//! whose expected version is stale fails with `VersionConflict` and the
//! caller re-reads and retries. Durable write-through happens after the
//! in-memory swap, outside the map lock.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::{Itinerary, ItineraryId};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("itinerary not found: {0}")]
    NotFound(ItineraryId),

    #[error("itinerary already exists: {0}")]
    AlreadyExists(ItineraryId),

    #[error("version conflict on {id}: expected {expected}, stored {stored}")]
    VersionConflict {
        id: ItineraryId,
        expected: u64,
        stored: u64,
    },

    #[error("owner identity is immutable once persisted")]
    OwnerImmutable,

    /// The in-memory commit landed but durable write-through failed.
    #[error("persistence failed for {id}: {source}")]
    Persistence {
        id: ItineraryId,
        #[source]
        source: io::Error,
    },

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::VersionConflict { .. } | StoreError::Persistence { .. } => {
                Transience::Retryable
            }
            StoreError::LockPoisoned => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The version already moved; only durability is in doubt.
            StoreError::Persistence { .. } => Effect::Some,
            _ => Effect::None,
        }
    }
}

/// Durable sink invoked on every committed version.
///
/// The real store behind this is an external collaborator; the trait keeps
/// the engine testable without it.
pub trait Persistence: Send + Sync {
    fn persist(&self, itinerary: &Itinerary) -> io::Result<()>;
}

/// No-op persistence for tests and ephemeral runs.
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn persist(&self, _itinerary: &Itinerary) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON document per itinerary, written via temp file + rename so a
/// crash never leaves a torn document.
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &ItineraryId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl Persistence for JsonDirPersistence {
    fn persist(&self, itinerary: &Itinerary) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(itinerary)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.dir.join(format!(".{}.tmp", itinerary.id));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path_for(&itinerary.id))
    }
}

pub struct GraphStore {
    inner: Mutex<HashMap<ItineraryId, Arc<Itinerary>>>,
    persistence: Arc<dyn Persistence>,
}

impl GraphStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NullPersistence))
    }

    /// Register a freshly generated itinerary. The owner supplied here is
    /// final; no later commit may change it.
    pub fn insert(&self, itinerary: Itinerary) -> Result<(), StoreError> {
        let mut map = self.lock_map()?;
        if map.contains_key(&itinerary.id) {
            return Err(StoreError::AlreadyExists(itinerary.id));
        }
        let id = itinerary.id.clone();
        let snapshot = Arc::new(itinerary);
        map.insert(id.clone(), Arc::clone(&snapshot));
        drop(map);

        self.persistence
            .persist(&snapshot)
            .map_err(|source| StoreError::Persistence { id, source })
    }

    /// Cheap snapshot of the current graph.
    pub fn get(&self, id: &ItineraryId) -> Result<Arc<Itinerary>, StoreError> {
        let map = self.lock_map()?;
        map.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Compare-and-commit a working copy read at `expected_version`.
    ///
    /// On success the stored version becomes `expected_version + 1` and is
    /// written through to persistence. The map lock is held only for the
    /// compare and swap, never across the persistence call.
    pub fn commit(
        &self,
        id: &ItineraryId,
        expected_version: u64,
        mut working: Itinerary,
    ) -> Result<u64, StoreError> {
        let snapshot = {
            let mut map = self.lock_map()?;
            let current = map
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if current.version != expected_version {
                return Err(StoreError::VersionConflict {
                    id: id.clone(),
                    expected: expected_version,
                    stored: current.version,
                });
            }
            if current.owner != working.owner {
                return Err(StoreError::OwnerImmutable);
            }
            working.version = expected_version + 1;
            let snapshot = Arc::new(working);
            map.insert(id.clone(), Arc::clone(&snapshot));
            snapshot
        };

        let new_version = snapshot.version;
        self.persistence
            .persist(&snapshot)
            .map_err(|source| StoreError::Persistence {
                id: id.clone(),
                source,
            })?;
        Ok(new_version)
    }

    fn lock_map(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ItineraryId, Arc<Itinerary>>>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}
