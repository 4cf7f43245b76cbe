use async_trait::async_trait;
use convoke_core::{Message, RunSnapshot};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable conversation mirror for history, audit, and search.
///
/// Never authoritative: the AI provider is the system of record. Writes are
/// best-effort and at-most-once; callers go through `PersistenceSync` and
/// never observe failures here.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn upsert_run(&self, run: &RunSnapshot) -> Result<(), StoreError>;
}
