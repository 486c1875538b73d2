//! Per-document mutual exclusion for review computation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct DocumentLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held while a document is being computed. The map entry is dropped with
/// the last guard for that document.
pub struct DocumentGuard {
    doc_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: DocumentLocks,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, doc_id: &str) -> DocumentGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(doc_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        DocumentGuard {
            doc_id: doc_id.to_string(),
            guard: Some(guard),
            locks: self.clone(),
        }
    }
}

#[cfg(test)]
impl DocumentLocks {
    /// Number of documents with a live lock entry.
    fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map itself still references the mutex: nobody holds or waits on it.
        if map
            .get(&self.doc_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.doc_id);
        }
    }
}
