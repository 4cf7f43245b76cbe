//! Best-effort asynchronous mirror of conversation state.

use crate::traits::DurableStore;
use convoke_core::{Message, RunSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum MirrorJob {
    Message(Message),
    Run(RunSnapshot),
}

/// Fire-and-forget mirror into durable storage.
///
/// Enqueueing never blocks the primary flow and failures are logged, never
/// propagated. Mirrored state is for history/audit/search only; losing a
/// write loses nothing authoritative.
#[derive(Clone)]
pub struct PersistenceSync {
    tx: mpsc::UnboundedSender<MirrorJob>,
}

impl PersistenceSync {
    /// Start the mirror worker. The worker stops when the last
    /// `PersistenceSync` handle is dropped.
    pub fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match &job {
                    MirrorJob::Message(message) => store.insert_message(message).await,
                    MirrorJob::Run(run) => store.upsert_run(run).await,
                };
                if let Err(e) = result {
                    warn!("Mirror write failed, entry dropped: {}", e);
                }
            }
            debug!("Persistence sync worker stopped");
        });
        Self { tx }
    }

    pub fn mirror_message(&self, message: Message) {
        if self.tx.send(MirrorJob::Message(message)).is_err() {
            warn!("Persistence sync worker gone, message mirror dropped");
        }
    }

    pub fn mirror_run(&self, run: RunSnapshot) {
        if self.tx.send(MirrorJob::Run(run)).is_err() {
            warn!("Persistence sync worker gone, run mirror dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::traits::StoreError;
    use async_trait::async_trait;
    use convoke_core::{ContentPart, Role};
    use std::time::Duration;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_mirror_message_lands() {
        let store = Arc::new(MemoryStore::new());
        let sync = PersistenceSync::spawn(store.clone());

        let message = convoke_core::Message::new(
            "thread_1",
            Role::User,
            vec![ContentPart::Text {
                text: "hello".into(),
                citations: vec![],
            }],
        );
        sync.mirror_message(message.clone());

        wait_for(|| store.messages().len() == 1).await;
        assert_eq!(store.messages()[0].id, message.id);
    }

    struct FailingStore;

    #[async_trait]
    impl DurableStore for FailingStore {
        async fn insert_message(&self, _message: &convoke_core::Message) -> Result<(), StoreError> {
            Err(StoreError::Storage("disk on fire".to_string()))
        }

        async fn upsert_run(&self, _run: &RunSnapshot) -> Result<(), StoreError> {
            Err(StoreError::Storage("disk on fire".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_never_propagates() {
        let sync = PersistenceSync::spawn(Arc::new(FailingStore));

        // Both enqueues succeed even though every write fails.
        sync.mirror_message(convoke_core::Message::new("thread_1", Role::User, vec![]));
        sync.mirror_message(convoke_core::Message::new("thread_1", Role::User, vec![]));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
