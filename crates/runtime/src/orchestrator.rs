//! Top-level wiring and the common conversational flow.

use crate::locks::LockManager;
use crate::relay::{RelayConfig, RunSubscription, StreamRelay};
use crate::run_controller::{RunController, RunControllerConfig};
use crate::thread_manager::ThreadManager;
use convoke_core::{OrchestratorError, ResourceBindings, RunCapability, RunSnapshot, Thread};
use convoke_provider::ConversationProvider;
use convoke_store::{DurableStore, PersistenceSync};
use convoke_tools::{DispatcherConfig, ToolCallDispatcher, ToolRegistry};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorConfig {
    pub controller: RunControllerConfig,
    pub dispatcher: DispatcherConfig,
    pub relay: RelayConfig,
}

/// Wires the provider, tool registry, and durable store into one engine.
///
/// Construct inside a tokio runtime; the persistence mirror worker is
/// spawned here.
pub struct Orchestrator {
    threads: Arc<ThreadManager>,
    controller: Arc<RunController>,
    relay: StreamRelay,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ConversationProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn DurableStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let persistence = PersistenceSync::spawn(store);
        let locks = Arc::new(LockManager::new());
        let dispatcher = Arc::new(ToolCallDispatcher::with_config(registry, config.dispatcher));
        let controller = Arc::new(RunController::new(
            provider.clone(),
            dispatcher,
            persistence.clone(),
            locks.clone(),
            config.controller,
        ));
        let threads = Arc::new(ThreadManager::new(
            provider.clone(),
            locks,
            persistence.clone(),
        ));
        let relay = StreamRelay::new(provider, controller.clone(), persistence, config.relay);
        Self {
            threads,
            controller,
            relay,
        }
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn runs(&self) -> &RunController {
        &self.controller
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    /// One user turn: ensure a thread, append the message, start a run, and
    /// subscribe to its event stream.
    pub async fn post_message(
        &self,
        owner_id: &str,
        thread_id: Option<&str>,
        content: &str,
        capability: RunCapability,
    ) -> Result<(Thread, RunSnapshot, RunSubscription), OrchestratorError> {
        let thread = self
            .threads
            .ensure_thread(owner_id, thread_id, ResourceBindings::default())
            .await?;
        self.threads
            .append_user_message(owner_id, &thread.id, content, &[])
            .await?;
        let run = self.controller.start(&thread.id, capability).await?;
        let subscription = self.relay.subscribe(&run.id);
        Ok((thread, run, subscription))
    }
}
