//! Normalizes the provider's event stream (or a polling fallback) into the
//! client-facing StreamEvent protocol. Owns subscription cancellation.

use crate::run_controller::RunController;
use convoke_core::{OrchestratorError, RunSnapshot, RunState, StreamEvent};
use convoke_provider::{ConversationProvider, ProviderError, ProviderEvent};
use convoke_store::PersistenceSync;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Bounded for client backpressure: a slow consumer suspends the relay
    /// task instead of buffering without limit.
    pub channel_capacity: usize,
    /// Poll cadence when the provider has no event stream.
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A finite event stream for one run.
///
/// Ends with a terminal event followed by `Done`. Dropping (or `close`-ing)
/// the subscription stops the relay task and releases the underlying
/// provider stream or poll loop promptly.
pub struct RunSubscription {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl RunSubscription {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Relays run progress to clients.
pub struct StreamRelay {
    provider: Arc<dyn ConversationProvider>,
    controller: Arc<RunController>,
    persistence: PersistenceSync,
    config: RelayConfig,
}

impl StreamRelay {
    pub fn new(
        provider: Arc<dyn ConversationProvider>,
        controller: Arc<RunController>,
        persistence: PersistenceSync,
        config: RelayConfig,
    ) -> Self {
        Self {
            provider,
            controller,
            persistence,
            config,
        }
    }

    /// Open a fresh subscription for a run.
    ///
    /// Not restartable: each subscription issues a fresh provider stream or
    /// poll and may replay events an earlier subscription already saw.
    /// Events for one run arrive in provider order; no ordering holds
    /// across runs.
    pub fn subscribe(&self, run_id: &str) -> RunSubscription {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let cancel = CancellationToken::new();
        let task = RelayTask {
            provider: self.provider.clone(),
            controller: self.controller.clone(),
            persistence: self.persistence.clone(),
            run_id: run_id.to_string(),
            poll_interval: self.config.poll_interval,
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());
        RunSubscription { rx, cancel }
    }
}

#[derive(PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Subscriber gone or subscription closed; stop all work.
    Closed,
}

struct RelayTask {
    provider: Arc<dyn ConversationProvider>,
    controller: Arc<RunController>,
    persistence: PersistenceSync,
    run_id: String,
    poll_interval: Duration,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl RelayTask {
    async fn run(self) {
        if let Err(e) = self.relay().await {
            warn!("Relay for run {} failed: {}", self.run_id, e);
            let _ = self
                .deliver(StreamEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
        }
        let _ = self.deliver(StreamEvent::Done).await;
        debug!("Relay for run {} finished", self.run_id);
    }

    async fn relay(&self) -> Result<(), OrchestratorError> {
        let snapshot = self.controller.get(&self.run_id)?;
        if self.deliver(StreamEvent::Created { run: snapshot.clone() }).await == Delivery::Closed {
            return Ok(());
        }
        if snapshot.state.is_terminal() {
            // Late subscription to a settled run: terminal event, then done.
            self.emit_terminal(&snapshot).await;
            return Ok(());
        }

        match self
            .provider
            .stream_run(&snapshot.thread_id, &self.run_id)
            .await
        {
            Ok(events) => self.stream_loop(events).await,
            Err(ProviderError::StreamingUnsupported) => {
                debug!("Provider stream unavailable for run {}, polling", self.run_id);
                self.poll_loop(snapshot.state).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_loop(
        &self,
        mut events: mpsc::Receiver<ProviderEvent>,
    ) -> Result<(), OrchestratorError> {
        let mut terminal_emitted = false;

        loop {
            let event = tokio::select! {
                // Dropping `events` here also tears down the provider pump.
                _ = self.cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            let Some(event) = event else { break };

            let delivery = match event {
                ProviderEvent::RunStatus { run } => {
                    let run = self.controller.record(run);
                    match run.state {
                        RunState::InProgress => {
                            self.deliver(StreamEvent::RunInProgress {
                                run_id: run.id.clone(),
                            })
                            .await
                        }
                        RunState::RequiresAction => {
                            if self.handle_pause(&run).await? == Delivery::Closed {
                                return Ok(());
                            }
                            let current = self.controller.get(&self.run_id)?;
                            if current.state.is_terminal() {
                                terminal_emitted = true;
                                if self.emit_terminal(&current).await == Delivery::Closed {
                                    return Ok(());
                                }
                            }
                            Delivery::Delivered
                        }
                        state if state.is_terminal() => {
                            terminal_emitted = true;
                            self.emit_terminal(&run).await
                        }
                        // queued / cancelling produce no client event
                        _ => Delivery::Delivered,
                    }
                }
                ProviderEvent::MessageDelta { message_id, text } => {
                    self.deliver(StreamEvent::MessageDelta {
                        message_id,
                        delta: text,
                    })
                    .await
                }
                ProviderEvent::MessageCompleted { message } => {
                    self.persistence.mirror_message(message.clone());
                    self.deliver(StreamEvent::MessageCompleted { message }).await
                }
                ProviderEvent::StreamError { message } => {
                    return Err(OrchestratorError::Provider(message));
                }
                ProviderEvent::StreamEnd => break,
            };

            if delivery == Delivery::Closed {
                return Ok(());
            }
        }

        if !terminal_emitted {
            // Assistants-style streams close at a pause; by now the run has
            // been resumed with tool outputs and needs a fresh event source.
            let snapshot = self.controller.get(&self.run_id)?;
            if snapshot.state.is_terminal() {
                self.emit_terminal(&snapshot).await;
            } else {
                debug!(
                    "Provider stream for run {} ended mid-run, polling to terminal",
                    self.run_id
                );
                return self.poll_loop(snapshot.state).await;
            }
        }
        Ok(())
    }

    async fn poll_loop(&self, initial: RunState) -> Result<(), OrchestratorError> {
        let mut last_state = initial;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let mut snapshot = self.controller.refresh(&self.run_id).await?;

            if snapshot.state != last_state
                && self.emit_transition(&snapshot).await == Delivery::Closed
            {
                return Ok(());
            }

            if snapshot.state == RunState::RequiresAction {
                snapshot = self.controller.resolve_required_action(&self.run_id).await?;
                if snapshot.state == RunState::InProgress
                    && self
                        .deliver(StreamEvent::RunInProgress {
                            run_id: snapshot.id.clone(),
                        })
                        .await
                        == Delivery::Closed
                {
                    return Ok(());
                }
            }

            if snapshot.state.is_terminal() {
                return self.finish(&snapshot).await;
            }

            last_state = snapshot.state;
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Non-terminal state-change events for the polling path.
    async fn emit_transition(&self, snapshot: &RunSnapshot) -> Delivery {
        match snapshot.state {
            RunState::InProgress => {
                self.deliver(StreamEvent::RunInProgress {
                    run_id: snapshot.id.clone(),
                })
                .await
            }
            RunState::RequiresAction => {
                let tool_calls = snapshot
                    .required_action
                    .clone()
                    .map(|a| a.tool_calls)
                    .unwrap_or_default();
                self.deliver(StreamEvent::RunRequiresAction {
                    run_id: snapshot.id.clone(),
                    tool_calls,
                })
                .await
            }
            _ => Delivery::Delivered,
        }
    }

    /// Terminal handling for the polling path. Polling sees no deltas, so
    /// the final assistant message is fetched whole on completion.
    async fn finish(&self, snapshot: &RunSnapshot) -> Result<(), OrchestratorError> {
        if snapshot.state == RunState::Completed {
            match self.provider.list_messages(&snapshot.thread_id, 1).await {
                Ok(messages) => {
                    if let Some(message) = messages.into_iter().next() {
                        self.persistence.mirror_message(message.clone());
                        if self.deliver(StreamEvent::MessageCompleted { message }).await
                            == Delivery::Closed
                        {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    // Run outcome is already settled; the terminal event
                    // still goes out.
                    warn!("Could not fetch final message for run {}: {}", self.run_id, e);
                }
            }
        }
        self.emit_terminal(snapshot).await;
        Ok(())
    }

    async fn emit_terminal(&self, run: &RunSnapshot) -> Delivery {
        let event = match run.state {
            RunState::Completed => StreamEvent::RunCompleted { run: run.clone() },
            RunState::Cancelled => StreamEvent::RunCancelled { run: run.clone() },
            RunState::Failed | RunState::Expired => StreamEvent::RunFailed { run: run.clone() },
            _ => return Delivery::Delivered,
        };
        self.deliver(event).await
    }

    /// Resolve a streaming-path pause. Emits the pause event before
    /// dispatching so the client sees the state the provider reported, and
    /// `run.in_progress` once the run has resumed.
    async fn handle_pause(&self, run: &RunSnapshot) -> Result<Delivery, OrchestratorError> {
        let tool_calls = run
            .required_action
            .clone()
            .map(|a| a.tool_calls)
            .unwrap_or_default();
        if self
            .deliver(StreamEvent::RunRequiresAction {
                run_id: run.id.clone(),
                tool_calls,
            })
            .await
            == Delivery::Closed
        {
            return Ok(Delivery::Closed);
        }
        let resumed = self.controller.resolve_required_action(&self.run_id).await?;
        if resumed.state == RunState::InProgress {
            return Ok(self
                .deliver(StreamEvent::RunInProgress {
                    run_id: resumed.id.clone(),
                })
                .await);
        }
        Ok(Delivery::Delivered)
    }

    async fn deliver(&self, event: StreamEvent) -> Delivery {
        tokio::select! {
            _ = self.cancel.cancelled() => Delivery::Closed,
            sent = self.tx.send(event) => {
                if sent.is_ok() {
                    Delivery::Delivered
                } else {
                    Delivery::Closed
                }
            }
        }
    }
}
