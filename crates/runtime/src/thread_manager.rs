//! Thread lifecycle and resource bindings.

use crate::locks::LockManager;
use chrono::Utc;
use convoke_core::{Message, OrchestratorError, ResourceBindings, Role, Thread};
use convoke_provider::ConversationProvider;
use convoke_store::PersistenceSync;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Creates and retrieves conversation threads and their attached resources.
pub struct ThreadManager {
    provider: Arc<dyn ConversationProvider>,
    locks: Arc<LockManager>,
    persistence: PersistenceSync,
    threads: Mutex<HashMap<String, Thread>>,
}

impl ThreadManager {
    pub fn new(
        provider: Arc<dyn ConversationProvider>,
        locks: Arc<LockManager>,
        persistence: PersistenceSync,
    ) -> Self {
        Self {
            provider,
            locks,
            persistence,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent per logical conversation: a supplied thread id is validated
    /// to belong to the caller; otherwise a new thread is created.
    ///
    /// Provider failures surface as-is with no retry; retrying is the
    /// caller's policy at this layer.
    pub async fn ensure_thread(
        &self,
        owner_id: &str,
        thread_id: Option<&str>,
        bindings: ResourceBindings,
    ) -> Result<Thread, OrchestratorError> {
        if let Some(id) = thread_id {
            return self.authorize(owner_id, id);
        }

        let id = self.provider.create_thread(&bindings).await?;
        info!("Created thread {} for owner {}", id, owner_id);
        let thread = Thread {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            bindings,
            created_at: Utc::now(),
        };
        self.threads.lock().insert(id, thread.clone());
        Ok(thread)
    }

    /// Replace the binding set. Last write wins; the per-thread lock keeps
    /// concurrent binders from interleaving the provider update and the
    /// local read-modify-write.
    pub async fn bind_resources(
        &self,
        owner_id: &str,
        thread_id: &str,
        bindings: ResourceBindings,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.locks.lock(thread_id).await;
        self.authorize(owner_id, thread_id)?;

        self.provider
            .update_thread_bindings(thread_id, &bindings)
            .await?;

        if let Some(thread) = self.threads.lock().get_mut(thread_id) {
            thread.bindings = bindings;
        }
        Ok(())
    }

    /// Append a user turn and mirror it.
    pub async fn append_user_message(
        &self,
        owner_id: &str,
        thread_id: &str,
        content: &str,
        attachments: &[String],
    ) -> Result<Message, OrchestratorError> {
        self.authorize(owner_id, thread_id)?;
        let message = self
            .provider
            .append_message(thread_id, Role::User, content, attachments)
            .await?;
        self.persistence.mirror_message(message.clone());
        Ok(message)
    }

    pub async fn delete_thread(
        &self,
        owner_id: &str,
        thread_id: &str,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.locks.lock(thread_id).await;
        self.authorize(owner_id, thread_id)?;
        self.provider.delete_thread(thread_id).await?;
        self.threads.lock().remove(thread_id);
        info!("Deleted thread {}", thread_id);
        Ok(())
    }

    pub fn get(&self, thread_id: &str) -> Option<Thread> {
        self.threads.lock().get(thread_id).cloned()
    }

    fn authorize(&self, owner_id: &str, thread_id: &str) -> Result<Thread, OrchestratorError> {
        let thread = self
            .threads
            .lock()
            .get(thread_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("thread {thread_id}")))?;
        if thread.owner_id != owner_id {
            return Err(OrchestratorError::Forbidden(format!(
                "thread {thread_id} does not belong to caller"
            )));
        }
        Ok(thread)
    }
}
