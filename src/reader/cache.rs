//! Two tier cache of decoded chunks: an LRU in memory, optionally backed by a persistent cache
//! on disk.
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

#[cfg(feature = "persistent")]
use super::persist::PersistentCache;
use crate::idx::TypedArray;

type Key = (String, Vec<u64>);

pub struct ChunkCache {
    origin: String,
    memory: Mutex<LruCache<Key, Arc<TypedArray>>>,

    #[cfg(feature = "persistent")]
    persistent: Option<PersistentCache>,
}

impl ChunkCache {
    /// A cache holding at most `entries` chunks in memory.
    pub fn new(origin: &str, entries: usize) -> ChunkCache {
        ChunkCache {
            origin: origin.to_string(),
            memory: Mutex::new(LruCache::new(
                NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN),
            )),
            #[cfg(feature = "persistent")]
            persistent: None,
        }
    }

    #[cfg(feature = "persistent")]
    pub fn with_persistent(mut self, p: PersistentCache) -> ChunkCache {
        self.persistent = Some(p);
        self
    }

    /// Look up a chunk in memory only.
    pub fn get_memory(&self, dataset: &str, coord: &[u64]) -> Option<Arc<TypedArray>> {
        let key = (dataset.to_string(), coord.to_vec());
        self.memory.lock().ok()?.get(&key).cloned()
    }

    /// Look up a chunk, in memory first. A hit on disk is promoted to memory.
    pub async fn get(&self, dataset: &str, coord: &[u64]) -> Option<Arc<TypedArray>> {
        if let Some(a) = self.get_memory(dataset, coord) {
            return Some(a);
        }

        #[cfg(feature = "persistent")]
        if let Some(p) = &self.persistent {
            if let Some(a) = p.load(&self.origin, dataset, coord).await {
                log::trace!("{dataset}{coord:?}: persistent cache hit");
                let a = Arc::new(a);
                if let Ok(mut m) = self.memory.lock() {
                    m.put((dataset.to_string(), coord.to_vec()), Arc::clone(&a));
                }
                return Some(a);
            }
        }

        None
    }

    pub async fn insert(&self, dataset: &str, coord: &[u64], a: Arc<TypedArray>) {
        #[cfg(feature = "persistent")]
        if let Some(p) = &self.persistent {
            p.store(&self.origin, dataset, coord, Arc::clone(&a)).await;
        }

        if let Ok(mut m) = self.memory.lock() {
            m.put((dataset.to_string(), coord.to_vec()), a);
        }
    }

    /// Chunks held in memory.
    pub fn len(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the memory tier and flush the persistent one.
    pub fn clear(&self) {
        if let Ok(mut m) = self.memory.lock() {
            m.clear();
        }

        #[cfg(feature = "persistent")]
        if let Some(p) = &self.persistent {
            p.flush();
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}
