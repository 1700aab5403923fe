//! Persistent storage for learned codes and toggle flags
//!
//! Each store holds one JSON document, loaded and saved whole. On disk
//! the document sits in a versioned envelope:
//!
//! ```json
//! { "version": 1, "key": "wfirex4_codes", "data": { ... } }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{DeviceError, Result};

pub const STORAGE_VERSION: u32 = 1;

/// Whole-document key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load the stored document, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<Value>>;
    async fn save(&self, data: &Value) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    key: String,
    data: Value,
}

/// JSON file at `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    key: String,
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: &Path, key: &str) -> Self {
        Self {
            key: key.to_string(),
            path: dir.join(format!("{}.json", key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DeviceError::Store(format!(
                    "failed to read {:?}: {}",
                    self.path, e
                )))
            }
        };

        let envelope: Envelope = serde_json::from_str(&content)?;
        if envelope.version != STORAGE_VERSION {
            warn!(
                "{:?} has storage version {}, expected {}",
                self.path, envelope.version, STORAGE_VERSION
            );
        }
        Ok(Some(envelope.data))
    }

    async fn save(&self, data: &Value) -> Result<()> {
        let envelope = Envelope {
            version: STORAGE_VERSION,
            key: self.key.clone(),
            data: data.clone(),
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DeviceError::Store(format!("failed to create {:?}: {}", dir, e)))?;
        }

        // Replace via a temp file so readers never see a partial document
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| DeviceError::Store(format!("failed to write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DeviceError::Store(format!("failed to replace {:?}: {}", self.path, e)))?;

        debug!("Saved {:?}", self.path);
        Ok(())
    }
}

struct Pending {
    handle: JoinHandle<()>,
    data: Value,
}

/// Coalesces rapid saves into one write after `delay`
///
/// Each `schedule` cancels the previous pending write and starts a new
/// timer with the latest data.
pub struct DebouncedSave {
    store: Arc<dyn KeyValueStore>,
    delay: Duration,
    pending: Option<Pending>,
}

impl DebouncedSave {
    pub fn new(store: Arc<dyn KeyValueStore>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            pending: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn schedule(&mut self, data: Value) {
        if let Some(previous) = self.pending.take() {
            previous.handle.abort();
        }

        let store = Arc::clone(&self.store);
        let delay = self.delay;
        let snapshot = data.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.save(&snapshot).await {
                error!("Deferred save failed: {}", e);
            }
        });

        self.pending = Some(Pending { handle, data });
    }

    /// Write any pending data now
    pub async fn flush(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(pending) if !pending.handle.is_finished() => {
                pending.handle.abort();
                self.store.save(&pending.data).await
            }
            _ => Ok(()),
        }
    }
}

impl Drop for DebouncedSave {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            if !pending.handle.is_finished() {
                warn!("Dropping debounced save with unsaved data; call flush() first");
            }
        }
    }
}
