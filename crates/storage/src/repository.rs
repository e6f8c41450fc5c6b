use async_trait::async_trait;
use reader_core::model::{CaseId, CaseProgress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by cache adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    /// The stored snapshot could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True when the stored snapshot is corrupt rather than unreachable.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Serialization(_))
    }
}

/// Persisted flags for one case.
///
/// Missing fields read as `false`; unknown fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProgress {
    #[serde(default)]
    pub pre_completed: bool,
    #[serde(default)]
    pub post_completed: bool,
}

/// Whole-map snapshot of case progress, keyed by case id.
///
/// Serialized as a plain JSON object: `{"12": {"preCompleted": true, ...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressSnapshot(BTreeMap<CaseId, CachedProgress>);

impl ProgressSnapshot {
    #[must_use]
    pub fn from_progress(progress: impl IntoIterator<Item = CaseProgress>) -> Self {
        Self(
            progress
                .into_iter()
                .map(|p| {
                    (
                        p.case_id,
                        CachedProgress {
                            pre_completed: p.pre_completed,
                            post_completed: p.post_completed,
                        },
                    )
                })
                .collect(),
        )
    }

    /// Convert back into per-case progress, ordered by case id.
    #[must_use]
    pub fn into_progress(self) -> Vec<CaseProgress> {
        self.0
            .into_iter()
            .map(|(case_id, cached)| CaseProgress {
                case_id,
                pre_completed: cached.pre_completed,
                post_completed: cached.post_completed,
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, case_id: CaseId) -> Option<CachedProgress> {
        self.0.get(&case_id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` for malformed payloads.
    pub fn from_json(payload: &str) -> Result<Self, StorageError> {
        serde_json::from_str(payload).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// Durable key-value store for the progress snapshot.
///
/// Writes replace the whole snapshot; the last writer wins.
#[async_trait]
pub trait ProgressCache: Send + Sync {
    /// Read the stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` when the stored payload is corrupt,
    /// or `StorageError::Connection` when the store is unreachable.
    async fn load(&self) -> Result<Option<ProgressSnapshot>, StorageError>;

    /// Overwrite the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the snapshot cannot be written.
    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError>;

    /// Remove the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be written.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// In-memory cache holding the encoded payload, for tests and offline use.
#[derive(Clone, Default)]
pub struct InMemoryProgressCache {
    payload: Arc<Mutex<Option<String>>>,
}

impl InMemoryProgressCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with a raw payload (which need not be valid JSON).
    #[must_use]
    pub fn with_raw(payload: impl Into<String>) -> Self {
        Self {
            payload: Arc::new(Mutex::new(Some(payload.into()))),
        }
    }

    /// Currently stored raw payload.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn raw(&self) -> Result<Option<String>, StorageError> {
        let guard = self
            .payload
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.clone())
    }
}

#[async_trait]
impl ProgressCache for InMemoryProgressCache {
    async fn load(&self) -> Result<Option<ProgressSnapshot>, StorageError> {
        self.raw()?
            .map(|payload| ProgressSnapshot::from_json(&payload))
            .transpose()
    }

    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        let encoded = snapshot.to_json()?;
        let mut guard = self
            .payload
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        *guard = Some(encoded);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut guard = self
            .payload
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Aggregates the cache handle used by a reader session.
#[derive(Clone)]
pub struct Storage {
    pub progress: Arc<dyn ProgressCache>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let progress: Arc<dyn ProgressCache> = Arc::new(InMemoryProgressCache::new());
        Self { progress }
    }
}
