use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;

use super::{MetadataError, MetadataStore};

/// In-process discovery store.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Bytes>,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store shared by every caller using the same `name` in this process.
    /// Contents live as long as some caller holds the store; a name nobody
    /// holds starts empty again.
    pub fn shared(name: &str) -> Arc<Self> {
        static STORES: OnceLock<DashMap<String, Weak<MemoryStore>>> = OnceLock::new();
        let stores = STORES.get_or_init(DashMap::new);
        let mut entry = stores.entry(name.to_string()).or_default();
        if let Some(store) = entry.upgrade() {
            return store;
        }
        let store = Arc::new(MemoryStore::new());
        *entry = Arc::downgrade(&store);
        drop(entry);
        stores.retain(|_, weak| weak.strong_count() > 0);
        store
    }

    /// Simulates the service going away; every call fails while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_online(&self) -> Result<(), MetadataError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MetadataError::Unavailable(
                "in-memory store is offline".to_string(),
            ))
        }
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        self.ensure_online()?;
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), MetadataError> {
        self.ensure_online()?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), MetadataError> {
        self.ensure_online()?;
        self.entries.remove(key);
        Ok(())
    }
}
