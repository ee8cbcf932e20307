//! Per-request orchestration.
//!
//! A [`TaskSupervisor`] owns one request end to end: route to an agent,
//! drive that agent's fallback chain, enforce the budget before every
//! attempt and every token, and emit an ordered event stream ending in
//! exactly one terminal event. Late provider results arriving after a
//! budget breach or cancellation are discarded, never emitted.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::chain::ChainError;
use crate::event::{Event, EventSink};
use crate::request::{Budget, DispatchResult, DispatchStatus, Request};
use crate::router::Router;

/// Terminal supervisor failures. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("budget exceeded before completion")]
    BudgetExceeded,

    #[error("request was cancelled")]
    Cancelled,
}

/// Lifecycle of one request. Forward-only; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Created,
    Routing,
    Dispatching,
    Streaming,
    Completed,
    Failed,
}

fn advance(request_id: Uuid, from: SupervisorState, to: SupervisorState) -> SupervisorState {
    tracing::debug!(request_id = %request_id, ?from, ?to, "Supervisor state transition");
    to
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TripReason {
    Budget,
    Cancelled,
}

#[derive(Debug)]
struct GateState {
    tokens: u64,
    tripped: Option<TripReason>,
    sealed: bool,
}

/// Budget-gating wrapper around the caller's sink.
///
/// Checks wall time and the token cap before forwarding each token; once a
/// bound trips (or the run is cancelled), every further event is dropped
/// until the supervisor emits the single terminal event via [`Self::finish`].
/// Tripping also cancels `abort` so the chain stops promptly.
struct GatedSink<'a> {
    inner: &'a dyn EventSink,
    state: Mutex<GateState>,
    started: Instant,
    budget: Budget,
    abort: CancellationToken,
}

impl<'a> GatedSink<'a> {
    fn new(inner: &'a dyn EventSink, started: Instant, budget: Budget, abort: CancellationToken) -> Self {
        Self {
            inner,
            state: Mutex::new(GateState {
                tokens: 0,
                tripped: None,
                sealed: false,
            }),
            started,
            budget,
            abort,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn trip_reason(&self) -> Option<TripReason> {
        self.lock().tripped
    }

    /// Emit the terminal event and seal the stream. Idempotent: only the
    /// first terminal event passes through.
    fn finish(&self, event: Event) {
        let mut state = self.lock();
        if state.sealed {
            return;
        }
        state.sealed = true;
        drop(state);
        self.inner.emit(event);
    }
}

impl EventSink for GatedSink<'_> {
    fn emit(&self, event: Event) {
        let mut state = self.lock();
        if state.sealed || state.tripped.is_some() {
            return;
        }
        if self.abort.is_cancelled() {
            state.tripped = Some(TripReason::Cancelled);
            return;
        }

        if matches!(event, Event::Token { .. }) {
            if self.started.elapsed() >= self.budget.max_wall_time {
                state.tripped = Some(TripReason::Budget);
                self.abort.cancel();
                return;
            }
            if let Some(max) = self.budget.max_tokens {
                if state.tokens >= max {
                    state.tripped = Some(TripReason::Budget);
                    self.abort.cancel();
                    return;
                }
            }
            state.tokens += 1;
        }

        drop(state);
        self.inner.emit(event);
    }
}

/// Top-level state machine for one request.
///
/// Shares only the registry (read-mostly snapshots) and per-agent circuit
/// state with concurrent supervisors; everything else is owned per run.
pub struct TaskSupervisor {
    registry: Arc<AgentRegistry>,
}

impl TaskSupervisor {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Run one request to completion.
    pub async fn run(&self, request: Request, sink: &dyn EventSink) -> DispatchResult {
        self.run_cancellable(request, sink, CancellationToken::new())
            .await
    }

    /// Run one request with cooperative cancellation.
    ///
    /// Cancelling the token stops event emission promptly and ends the run
    /// with a terminal `Error { kind: "cancelled" }`.
    pub async fn run_cancellable(
        &self,
        request: Request,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> DispatchResult {
        let started = Instant::now();
        let request_id = request.id;
        let state = SupervisorState::Created;

        let state = advance(request_id, state, SupervisorState::Routing);
        let snapshot = self.registry.snapshot();
        let agent = Router::select(&request, &snapshot);

        let abort = cancel.child_token();
        let gate = GatedSink::new(sink, started, request.budget.clone(), abort.clone());

        gate.emit(Event::AgentTaskStart {
            id: request_id,
            agent: agent.name.clone(),
            description: truncate(&request.text, 80),
        });
        gate.emit(Event::AgentTaskProgress {
            id: request_id,
            fraction: 0.0,
        });

        let state = advance(request_id, state, SupervisorState::Dispatching);
        // A wall time too large to represent as a deadline is effectively
        // unbounded; a year keeps the per-attempt timeout slices sane.
        let deadline = started
            .checked_add(request.budget.max_wall_time)
            .unwrap_or_else(|| started + Duration::from_secs(365 * 86_400));
        let state = advance(request_id, state, SupervisorState::Streaming);

        let run = agent
            .chain
            .generate_stream(&request.text, &request.budget, &gate, deadline, &abort)
            .await;

        let trip = gate.trip_reason();
        let (status, final_text) = match run.outcome {
            Ok(text) => match trip {
                // A result that lands after a breach is discarded.
                Some(TripReason::Budget) => (DispatchStatus::BudgetExceeded, String::new()),
                Some(TripReason::Cancelled) => (DispatchStatus::Cancelled, String::new()),
                None if run.fallback_used => (DispatchStatus::FallbackUsed, text),
                None => (DispatchStatus::Ok, text),
            },
            Err(ChainError::AllProvidersFailed) => {
                (DispatchStatus::AllProvidersFailed, String::new())
            }
            Err(ChainError::BudgetExhausted) => (DispatchStatus::BudgetExceeded, String::new()),
            Err(ChainError::Cancelled) => match trip {
                Some(TripReason::Budget) => (DispatchStatus::BudgetExceeded, String::new()),
                _ => (DispatchStatus::Cancelled, String::new()),
            },
        };

        gate.emit(Event::AgentTaskDone {
            id: request_id,
            success: status.is_success(),
        });

        let state = if status.is_success() {
            gate.finish(Event::Done {
                final_text: final_text.clone(),
                metadata: json!({
                    "agent": agent.name,
                    "providers": run.providers_tried,
                    "attempts": run.attempts,
                }),
            });
            advance(request_id, state, SupervisorState::Completed)
        } else {
            let (kind, message) = match status {
                DispatchStatus::BudgetExceeded => {
                    ("budget_exceeded", SupervisorError::BudgetExceeded.to_string())
                }
                DispatchStatus::Cancelled => {
                    ("cancelled", SupervisorError::Cancelled.to_string())
                }
                _ => (
                    "all_providers_failed",
                    ChainError::AllProvidersFailed.to_string(),
                ),
            };
            gate.finish(Event::Error {
                kind: kind.to_string(),
                message,
                recoverable: false,
            });
            advance(request_id, state, SupervisorState::Failed)
        };
        debug_assert!(matches!(
            state,
            SupervisorState::Completed | SupervisorState::Failed
        ));

        let elapsed = started.elapsed();
        tracing::info!(
            request_id = %request_id,
            agent = %agent.name,
            status = ?status,
            attempts = run.attempts,
            providers = ?run.providers_tried,
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatch finished"
        );

        DispatchResult {
            request_id,
            final_text,
            provider_chain_used: run.providers_tried,
            attempts: run.attempts,
            elapsed,
            status,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
