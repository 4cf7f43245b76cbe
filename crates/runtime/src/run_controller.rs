//! The run state machine.
//!
//! `queued → in_progress → {requires_action → in_progress}* → completed |
//! failed | cancelled | expired`, with `cancelling` between an explicit
//! cancel and provider confirmation.
//!
//! The provider holds a paused run open until every pending tool call has an
//! output. The controller treats "one output per presented call" as a hard
//! invariant enforced before any submission, and resolves stuck dispatches
//! by synthesizing error outputs instead of leaving the run open.

use crate::locks::LockManager;
use chrono::Utc;
use convoke_core::{
    OrchestratorError, RequiredAction, RunCapability, RunError, RunSnapshot, RunState, ToolOutput,
};
use convoke_provider::{ConversationProvider, ProviderError};
use convoke_store::PersistenceSync;
use convoke_tools::{CallOutcome, ToolCallDispatcher};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RunControllerConfig {
    /// Retry attempts for transient provider errors inside `advance`.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
}

impl Default for RunControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

struct RunEntry {
    snapshot: RunSnapshot,
    cancel: CancellationToken,
}

/// Creates runs, advances them through provider states, dispatches tool
/// calls on `requires_action`, and submits outputs.
pub struct RunController {
    provider: Arc<dyn ConversationProvider>,
    dispatcher: Arc<ToolCallDispatcher>,
    persistence: PersistenceSync,
    locks: Arc<LockManager>,
    config: RunControllerConfig,
    runs: Mutex<HashMap<String, RunEntry>>,
    active_by_thread: Mutex<HashMap<String, String>>,
}

impl RunController {
    pub fn new(
        provider: Arc<dyn ConversationProvider>,
        dispatcher: Arc<ToolCallDispatcher>,
        persistence: PersistenceSync,
        locks: Arc<LockManager>,
        config: RunControllerConfig,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            persistence,
            locks,
            config,
            runs: Mutex::new(HashMap::new()),
            active_by_thread: Mutex::new(HashMap::new()),
        }
    }

    /// Create a run on a thread.
    ///
    /// Runs inside the per-thread critical section: of any number of
    /// concurrent `start` calls on one thread, exactly one succeeds and the
    /// rest receive `ConflictActiveRun`. Provider errors here surface
    /// synchronously with no run created.
    pub async fn start(
        &self,
        thread_id: &str,
        capability: RunCapability,
    ) -> Result<RunSnapshot, OrchestratorError> {
        let _guard = self.locks.lock(thread_id).await;

        if self.has_active_run(thread_id) {
            return Err(OrchestratorError::ConflictActiveRun(thread_id.to_string()));
        }

        let snapshot = self.provider.create_run(thread_id, &capability).await?;
        info!("Started run {} on thread {}", snapshot.id, thread_id);

        self.active_by_thread
            .lock()
            .insert(thread_id.to_string(), snapshot.id.clone());
        self.runs.lock().insert(
            snapshot.id.clone(),
            RunEntry {
                snapshot: snapshot.clone(),
                cancel: CancellationToken::new(),
            },
        );
        self.persistence.mirror_run(snapshot.clone());
        Ok(snapshot)
    }

    pub fn get(&self, run_id: &str) -> Result<RunSnapshot, OrchestratorError> {
        self.runs
            .lock()
            .get(run_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id}")))
    }

    /// Single step for polling callers: refresh from the provider and, if
    /// the run paused for tool execution, resolve the batch.
    pub async fn advance(&self, run_id: &str) -> Result<RunState, OrchestratorError> {
        let snapshot = self.refresh(run_id).await?;
        if snapshot.state == RunState::RequiresAction {
            let snapshot = self.resolve_required_action(run_id).await?;
            return Ok(snapshot.state);
        }
        Ok(snapshot.state)
    }

    /// Re-read the run from the provider, retrying transient errors.
    /// A non-retryable error (or exhausted retries) fails the run.
    pub async fn refresh(&self, run_id: &str) -> Result<RunSnapshot, OrchestratorError> {
        let current = self.get(run_id)?;
        if current.state.is_terminal() {
            return Ok(current);
        }

        match self
            .with_retry(|| self.provider.get_run(&current.thread_id, run_id))
            .await
        {
            Ok(snapshot) => Ok(self.record(snapshot)),
            Err(e) => {
                self.fail_run(run_id, &e);
                Err(e)
            }
        }
    }

    /// Dispatch the pending tool-call batch and submit one output per call.
    ///
    /// Handler-level failures ride along as encoded error outputs and the
    /// run resumes. Dispatcher-level misbehavior (deadline, panic) still
    /// submits synthesized outputs so the provider run cannot hang, then
    /// marks the run failed.
    pub async fn resolve_required_action(
        &self,
        run_id: &str,
    ) -> Result<RunSnapshot, OrchestratorError> {
        let snapshot = self.get(run_id)?;
        if snapshot.state != RunState::RequiresAction {
            return Ok(snapshot);
        }
        let Some(action) = snapshot.required_action.clone() else {
            return Ok(snapshot);
        };

        let cancel = self.cancel_token(run_id)?;
        info!(
            "Run {} paused on {} tool call(s)",
            run_id,
            action.tool_calls.len()
        );
        let outcomes = self.dispatcher.dispatch(&action.tool_calls, cancel.clone()).await;

        if cancel.is_cancelled() {
            debug!("Run {} cancelled during dispatch, outputs discarded", run_id);
            return self.get(run_id);
        }

        let outputs = collect_outputs(&action, &outcomes);
        let unexpected = outcomes.iter().any(|o| o.disposition.is_unexpected());

        match self
            .with_retry(|| {
                self.provider
                    .submit_tool_outputs(&snapshot.thread_id, run_id, &outputs)
            })
            .await
        {
            Ok(next) => {
                let next = self.record(next);
                if unexpected {
                    let err = OrchestratorError::Timeout(format!(
                        "tool dispatch for run {run_id} did not complete cleanly"
                    ));
                    warn!("{}", err);
                    if let Some(failed) = self.fail_run(run_id, &err) {
                        return Ok(failed);
                    }
                }
                Ok(next)
            }
            Err(e) => {
                self.fail_run(run_id, &e);
                Err(e)
            }
        }
    }

    /// Request cancellation. A no-op on terminal runs and on runs already
    /// cancelling; otherwise transitions to `cancelling`, cancels in-flight
    /// handlers and relays, and asks the provider to confirm.
    pub async fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let snapshot = self.get(run_id)?;
        if snapshot.state.is_terminal() || snapshot.state == RunState::Cancelling {
            debug!("Cancel on run {} in state {:?} is a no-op", run_id, snapshot.state);
            return Ok(());
        }

        info!("Cancelling run {}", run_id);
        {
            let mut runs = self.runs.lock();
            if let Some(entry) = runs.get_mut(run_id) {
                entry.snapshot.state = RunState::Cancelling;
                entry.cancel.cancel();
            }
        }

        let confirmed = self.provider.cancel_run(&snapshot.thread_id, run_id).await?;
        self.record(confirmed);
        Ok(())
    }

    /// Fold a provider-reported snapshot into local state. Used by both the
    /// polling path and the stream relay, so terminal bookkeeping happens
    /// exactly once regardless of how the state change was observed.
    pub fn record(&self, snapshot: RunSnapshot) -> RunSnapshot {
        {
            let mut runs = self.runs.lock();
            if let Some(entry) = runs.get_mut(&snapshot.id) {
                // A get_run response in flight when a cancel confirmed can
                // arrive after the terminal state; terminal is final.
                if entry.snapshot.state.is_terminal() && !snapshot.state.is_terminal() {
                    debug!(
                        "Dropping stale {:?} update for settled run {}",
                        snapshot.state, snapshot.id
                    );
                    return entry.snapshot.clone();
                }
                entry.snapshot = snapshot.clone();
                if snapshot.state.is_terminal() {
                    entry.cancel.cancel();
                }
            }
        }

        if snapshot.state.is_terminal() {
            let mut active = self.active_by_thread.lock();
            if active.get(&snapshot.thread_id).map(String::as_str) == Some(snapshot.id.as_str()) {
                active.remove(&snapshot.thread_id);
            }
            drop(active);
            self.persistence.mirror_run(snapshot.clone());
        }
        snapshot
    }

    pub fn cancel_token(&self, run_id: &str) -> Result<CancellationToken, OrchestratorError> {
        self.runs
            .lock()
            .get(run_id)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id}")))
    }

    fn has_active_run(&self, thread_id: &str) -> bool {
        let active = self.active_by_thread.lock();
        let Some(run_id) = active.get(thread_id) else {
            return false;
        };
        // Terminal runs are removed from the map in record(); a hit here is
        // active unless the run vanished entirely.
        self.runs
            .lock()
            .get(run_id)
            .map(|entry| entry.snapshot.state.is_active())
            .unwrap_or(false)
    }

    /// Locally mark a run failed with the given error. Returns the failed
    /// snapshot, or None if the run is unknown or already terminal.
    fn fail_run(&self, run_id: &str, err: &OrchestratorError) -> Option<RunSnapshot> {
        let mut snapshot = {
            let runs = self.runs.lock();
            runs.get(run_id).map(|entry| entry.snapshot.clone())?
        };
        if snapshot.state.is_terminal() {
            return Some(snapshot);
        }

        snapshot.state = RunState::Failed;
        snapshot.last_error = Some(RunError {
            code: err.code().to_string(),
            message: err.to_string(),
        });
        snapshot.completed_at = Some(Utc::now());
        Some(self.record(snapshot))
    }

    /// Bounded exponential backoff for transient provider errors. The single
    /// retry policy for all provider calls made mid-run.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delay = self.config.backoff_base;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err: OrchestratorError = e.into();
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        "Transient provider error (attempt {}/{}): {}",
                        attempt, self.config.max_retries, err
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Exactly one output per presented call, in presentation order. Outcomes
/// the dispatcher failed to produce (which would be a dispatcher bug) are
/// synthesized here; extras are dropped.
fn collect_outputs(action: &RequiredAction, outcomes: &[CallOutcome]) -> Vec<ToolOutput> {
    action
        .tool_calls
        .iter()
        .map(|call| {
            outcomes
                .iter()
                .find(|o| o.output.tool_call_id == call.id)
                .map(|o| o.output.clone())
                .unwrap_or_else(|| {
                    warn!("No outcome for tool call {}, synthesizing error", call.id);
                    ToolOutput::new(
                        &call.id,
                        json!({
                            "error": {
                                "code": "internal",
                                "message": "tool call produced no output"
                            }
                        })
                        .to_string(),
                    )
                })
        })
        .collect()
}
