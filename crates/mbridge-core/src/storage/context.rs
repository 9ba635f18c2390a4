//! Namespaced key-value persistence.
//!
//! Every namespace is one JSON document on disk. A [`StorageContext`] keeps the
//! document in memory and writes it through on every mutation, so the file
//! always reflects the last acknowledged `set`.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::storage::error::{StorageResult, StorageSystemError};
use crate::storage::provider::StorageProvider;

/// Durable store handing out per-namespace contexts
#[async_trait]
pub trait PersistenceStore: Send + Sync + fmt::Debug {
    /// Open (or return the already open) context for a namespace
    async fn context(&self, namespace: &str) -> StorageResult<StorageContext>;

    /// Close a namespace if open. Unknown namespaces are ignored.
    async fn close_context(&self, namespace: &str) -> StorageResult<()>;

    /// Close a namespace and delete its durable document
    async fn remove_context(&self, namespace: &str) -> StorageResult<()>;

    /// Namespaces with a durable document
    async fn namespaces(&self) -> StorageResult<Vec<String>>;

    /// Namespaces currently open
    async fn open_namespaces(&self) -> Vec<String>;

    /// Close every open namespace
    async fn close_all(&self) -> StorageResult<()>;
}

struct ContextInner {
    namespace: String,
    path: PathBuf,
    provider: Arc<dyn StorageProvider>,
    values: Mutex<Map<String, Value>>,
    closed: AtomicBool,
}

/// Handle to one open namespace; clones share the same document
#[derive(Clone)]
pub struct StorageContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext")
            .field("namespace", &self.inner.namespace)
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageContext {
    fn open(namespace: &str, path: PathBuf, provider: Arc<dyn StorageProvider>) -> StorageResult<Self> {
        let values = if provider.is_file(&path) {
            let content = provider.read_to_string(&path)?;
            match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    log::warn!("Storage context '{}' is not a JSON object, starting empty", namespace);
                    Map::new()
                }
                Err(e) => return Err(StorageSystemError::deserialization("json", e)),
            }
        } else {
            Map::new()
        };

        Ok(Self {
            inner: Arc::new(ContextInner {
                namespace: namespace.to_string(),
                path,
                provider,
                values: Mutex::new(values),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageSystemError::ContextClosed(self.inner.namespace.clone()));
        }
        Ok(())
    }

    /// Read a key, falling back to `default` when absent
    pub async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> StorageResult<T> {
        self.ensure_open()?;
        let value = self.inner.values.lock().await.get(key).cloned();
        match value {
            Some(value) => serde_json::from_value(value).map_err(|e| StorageSystemError::deserialization("json", e)),
            None => Ok(default),
        }
    }

    pub async fn contains(&self, key: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.inner.values.lock().await.contains_key(key))
    }

    /// Store a key and write the namespace document through. Memory only
    /// changes once the document is on disk.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        self.ensure_open()?;
        let value = serde_json::to_value(value).map_err(|e| StorageSystemError::serialization("json", e))?;
        let mut values = self.inner.values.lock().await;
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *values = next;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let mut values = self.inner.values.lock().await;
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.persist(&next)?;
        *values = next;
        Ok(())
    }

    pub async fn clear(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let mut values = self.inner.values.lock().await;
        self.persist(&Map::new())?;
        values.clear();
        Ok(())
    }

    pub async fn keys(&self) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.inner.values.lock().await.keys().cloned().collect())
    }

    /// Mark the context closed. Further access fails with `ContextClosed`.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Closed storage context '{}'", self.inner.namespace);
        }
    }

    fn persist(&self, values: &Map<String, Value>) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(values).map_err(|e| StorageSystemError::serialization("json", e))?;
        self.inner.provider.write_string(&self.inner.path, &content)
    }
}

/// [`PersistenceStore`] keeping one `<namespace>.json` file per namespace
pub struct JsonContextStore {
    provider: Arc<dyn StorageProvider>,
    dir: PathBuf,
    contexts: Mutex<BTreeMap<String, StorageContext>>,
}

impl fmt::Debug for JsonContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonContextStore")
            .field("provider", &self.provider.name())
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl JsonContextStore {
    /// `dir` is relative to the provider's base path
    pub fn new(provider: Arc<dyn StorageProvider>, dir: PathBuf) -> Self {
        Self {
            provider,
            dir,
            contexts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn document_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_namespace(namespace)))
    }
}

#[async_trait]
impl PersistenceStore for JsonContextStore {
    async fn context(&self, namespace: &str) -> StorageResult<StorageContext> {
        let mut contexts = self.contexts.lock().await;
        if let Some(existing) = contexts.get(namespace) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let context = StorageContext::open(namespace, self.document_path(namespace), self.provider.clone())?;
        contexts.insert(namespace.to_string(), context.clone());
        Ok(context)
    }

    async fn close_context(&self, namespace: &str) -> StorageResult<()> {
        if let Some(context) = self.contexts.lock().await.remove(namespace) {
            context.close();
        }
        Ok(())
    }

    async fn remove_context(&self, namespace: &str) -> StorageResult<()> {
        self.close_context(namespace).await?;
        let path = self.document_path(namespace);
        if self.provider.is_file(&path) {
            self.provider.remove_file(&path)?;
        }
        Ok(())
    }

    async fn namespaces(&self) -> StorageResult<Vec<String>> {
        if !self.provider.is_dir(&self.dir) {
            return Ok(vec![]);
        }
        let names = self
            .provider
            .read_dir(&self.dir)?
            .into_iter()
            .filter_map(|path| {
                let file_name = path.file_name()?.to_str()?;
                file_name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        Ok(names)
    }

    async fn open_namespaces(&self) -> Vec<String> {
        self.contexts
            .lock()
            .await
            .iter()
            .filter(|(_, context)| !context.is_closed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn close_all(&self) -> StorageResult<()> {
        let mut contexts = self.contexts.lock().await;
        for context in contexts.values() {
            context.close();
        }
        contexts.clear();
        Ok(())
    }
}

/// File-name safe form of a namespace
pub fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
