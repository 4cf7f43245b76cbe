use crate::traits::{DurableStore, StoreError};
use async_trait::async_trait;
use convoke_core::{Message, RunSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-memory durable-store double, used in tests and single-process setups.
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
    runs: Mutex<HashMap<String, RunSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn upsert_run(&self, run: &RunSnapshot) -> Result<(), StoreError> {
        self.runs.lock().insert(run.id.clone(), run.clone());
        Ok(())
    }
}
