use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::record::RawRow;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("persistence gateway failure for `{key}`: {message}")]
pub struct GatewayError {
    pub key: String,
    pub message: String,
}

impl GatewayError {
    pub fn new(key: &str, message: impl Into<String>) -> Self {
        Self { key: key.to_string(), message: message.into() }
    }
}

/// Key → JSON blob storage consumed by the engine.
pub trait PersistenceGateway: Send + Sync {
    /// Read the blob stored under `key`.
    ///
    /// # Errors
    /// Returns [`GatewayError`] when the backing store cannot be read or the stored
    /// value is not valid JSON.
    fn get(&self, key: &str) -> Result<Option<Value>, GatewayError>;

    /// Replace the blob stored under `key`.
    ///
    /// # Errors
    /// Returns [`GatewayError`] when the write does not complete; the previous value
    /// stays in place.
    fn set(&self, key: &str, blob: &Value) -> Result<(), GatewayError>;
}

impl<T: PersistenceGateway + ?Sized> PersistenceGateway for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Value>, GatewayError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, blob: &Value) -> Result<(), GatewayError> {
        (**self).set(key, blob)
    }
}

/// Process-local gateway, used by tests and as a scratch backend.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    blobs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn get(&self, key: &str) -> Result<Option<Value>, GatewayError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn set(&self, key: &str, blob: &Value) -> Result<(), GatewayError> {
        self.blobs.write().insert(key.to_string(), blob.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SourceError {
    #[error("snapshot not found: {0}")]
    NotFound(String),
    #[error("snapshot unreadable: {0}")]
    Unreadable(String),
}

/// Yields one snapshot of flat rows, in source order.
pub trait SnapshotSource {
    /// Human-readable origin, used in logs and reports.
    fn describe(&self) -> String;

    /// Fetch the full snapshot.
    ///
    /// # Errors
    /// Returns [`SourceError`] when the snapshot is absent or cannot be parsed.
    fn fetch(&self) -> Result<Vec<RawRow>, SourceError>;
}
