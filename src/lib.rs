pub mod ai;
pub mod api;
pub mod config;
pub mod distlock;
pub mod error;
pub mod heat;
pub mod index;
pub mod orchestrate;
pub mod retrieve;
pub mod store;
pub mod util;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::MemoryConfig;
use crate::error::StrataError;
use crate::index::RelevanceIndex;
use crate::orchestrate::MemorySignal;
use crate::retrieve::Retriever;
use crate::store::TierStore;

pub type SharedStore = Arc<TierStore>;

/// Run a blocking database closure off the async runtime.
pub async fn db_call<T, F>(f: F) -> Result<T, StrataError>
where
    F: FnOnce() -> Result<T, StrataError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StrataError::Internal(format!("blocking task panicked: {e}")))?
}

/// LRU cache over text → embedding, keyed by the exact input string.
/// Saves round-trips to the embedding backend for repeated queries.
pub struct EmbedCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let mut guard = self.inner.lock();
        match guard.get(text) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, text: String, embedding: Vec<f32>) {
        self.inner.lock().put(text, embedding);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Shared state handed to every HTTP handler.
pub struct AppState {
    pub store: SharedStore,
    pub index: Arc<RelevanceIndex>,
    pub retriever: Arc<Retriever>,
    pub signals: mpsc::Sender<MemorySignal>,
    pub cfg: MemoryConfig,
    pub api_key: Option<String>,
    pub started_at: Instant,
}
