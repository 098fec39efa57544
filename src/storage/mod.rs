use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::warn;

/// Capacity of each subscriber's event queue. A subscriber that falls this
/// far behind is cut off and must re-list before watching again.
const WATCH_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("resource not found")]
    NotFound,
    #[error("resource conflict")]
    Conflict,
    #[error("persistence failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// One change notification. Serialized verbatim as a watch frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    #[serde(rename = "Type")]
    pub event_type: EventType,
    #[serde(rename = "Object")]
    pub object: Value,
}

/// A live watch. Dropping the receiver tears the subscription down on the
/// next delivery attempt; `Registry::stop_watch` removes it eagerly.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<Event>,
}

struct Watcher {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    data: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
    next_version: u64,
    next_watcher_id: u64,
}

/// Versioned key→object store shared by every control-plane component.
/// Writes are serialized behind the write lock and are durable (and
/// delivered to every matching subscriber queue) before they return.
pub struct Registry {
    inner: RwLock<Inner>,
    file_path: Option<PathBuf>,
}

impl Registry {
    /// In-memory only; nothing survives a restart.
    pub fn ephemeral() -> Self {
        Self {
            inner: RwLock::new(Inner {
                data: BTreeMap::new(),
                watchers: Vec::new(),
                next_version: 1,
                next_watcher_id: 1,
            }),
            file_path: None,
        }
    }

    /// File-backed registry. A missing file starts empty; an unreadable
    /// one is logged and discarded rather than blocking startup.
    pub async fn open(path: PathBuf) -> Self {
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, Value>>(&bytes) {
                Ok(data) => data,
                Err(err) => {
                    warn!("failed to load store from {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("failed to load store from {}: {err}", path.display());
                BTreeMap::new()
            }
        };

        // Resume the version counter above anything already persisted.
        let max_version = data
            .values()
            .filter_map(|obj| obj["metadata"]["resourceVersion"].as_str())
            .filter_map(|rv| rv.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        Self {
            inner: RwLock::new(Inner {
                data,
                watchers: Vec::new(),
                next_version: max_version + 1,
                next_watcher_id: 1,
            }),
            file_path: Some(path),
        }
    }

    pub async fn create(&self, key: &str, mut obj: Value) -> Result<Value, StorageError> {
        let mut inner = self.inner.write().await;
        if inner.data.contains_key(key) {
            return Err(StorageError::Conflict);
        }

        stamp_version(&mut obj, inner.bump_version());
        inner.data.insert(key.to_string(), obj.clone());
        inner.notify(EventType::Added, key, &obj);
        self.sync(&inner).await?;
        Ok(obj)
    }

    /// Full replace. When the incoming object carries a resourceVersion it
    /// must match the stored one; a stale version is a `Conflict`. This is
    /// the optimistic-concurrency check leader election depends on.
    pub async fn update(&self, key: &str, mut obj: Value) -> Result<Value, StorageError> {
        let mut inner = self.inner.write().await;
        let stored = inner.data.get(key).ok_or(StorageError::NotFound)?;

        if let Some(claimed) = obj["metadata"]["resourceVersion"].as_str() {
            if !claimed.is_empty() {
                let current = stored["metadata"]["resourceVersion"].as_str().unwrap_or("");
                if claimed != current {
                    return Err(StorageError::Conflict);
                }
            }
        }

        stamp_version(&mut obj, inner.bump_version());
        inner.data.insert(key.to_string(), obj.clone());
        inner.notify(EventType::Modified, key, &obj);
        self.sync(&inner).await?;
        Ok(obj)
    }

    pub async fn get(&self, key: &str) -> Result<Value, StorageError> {
        let inner = self.inner.read().await;
        inner.data.get(key).cloned().ok_or(StorageError::NotFound)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let old = inner.data.remove(key).ok_or(StorageError::NotFound)?;
        inner.notify(EventType::Deleted, key, &old);
        self.sync(&inner).await?;
        Ok(())
    }

    pub async fn list(&self, prefix: &str) -> Vec<Value> {
        let inner = self.inner.read().await;
        inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Subscribe to every event whose key starts with `prefix`, from this
    /// moment forward.
    pub async fn watch(&self, prefix: &str) -> Subscription {
        let mut inner = self.inner.write().await;
        let id = inner.next_watcher_id;
        inner.next_watcher_id += 1;
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        inner.watchers.push(Watcher {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        Subscription { id, events: rx }
    }

    pub async fn stop_watch(&self, id: u64) {
        let mut inner = self.inner.write().await;
        inner.watchers.retain(|w| w.id != id);
    }

    #[cfg(test)]
    async fn watcher_count(&self) -> usize {
        self.inner.read().await.watchers.len()
    }

    /// Atomic replace of the whole keyspace: write a sibling temp file,
    /// then rename over the target.
    async fn sync(&self, inner: &Inner) -> Result<(), StorageError> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(&inner.data)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl Inner {
    fn bump_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    /// Enqueue the event to every matching subscriber. A queue that is
    /// full or abandoned closes that subscription.
    fn notify(&mut self, event_type: EventType, key: &str, obj: &Value) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.try_send(Event {
                event_type,
                object: obj.clone(),
            })
            .is_ok()
        });
    }
}

fn stamp_version(obj: &mut Value, version: u64) {
    if !obj["metadata"].is_object() {
        obj["metadata"] = serde_json::json!({});
    }
    obj["metadata"]["resourceVersion"] = Value::String(version.to_string());
}
