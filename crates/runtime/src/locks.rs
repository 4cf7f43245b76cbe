//! Per-thread serialization.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Async locks keyed by thread id.
///
/// Serializes run creation and binding updates per thread without
/// serializing unrelated threads. Lock entries are created on first use and
/// kept for the process lifetime; thread counts are small enough that no
/// eviction is needed.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock();
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        debug!("Acquiring thread lock: {}", thread_id);
        entry.lock_owned().await
    }
}
