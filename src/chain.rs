//! Ordered fallback chains over provider clients.
//!
//! A chain satisfies one generate request by trying its links in the
//! statically configured order until one succeeds or all are exhausted.
//! Retryable errors are retried locally within a link with backoff; the
//! chain never revisits a link after advancing past it in the same request.
//! Links whose circuit is open are skipped without an attempt.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitBreaker;
use crate::event::{Event, EventSink};
use crate::provider::{ProviderClient, ProviderError};
use crate::request::Budget;

/// Maximum number of journal records kept per chain.
const MAX_JOURNAL_RECORDS: usize = 200;

/// One failover event: a link was exhausted and the chain advanced.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// The chain this record belongs to.
    pub chain: String,
    /// Provider that was exhausted.
    pub from_provider: String,
    /// Error kind that exhausted it.
    pub reason: String,
    /// Cooldown applied to the link's circuit, if it opened.
    pub cooldown_secs: Option<f64>,
    /// 1-indexed position of the link in the chain.
    pub link_position: u32,
    pub chain_length: u32,
}

/// One link: a named provider plus its circuit state.
pub struct ProviderLink {
    pub name: String,
    pub provider: Arc<dyn ProviderClient>,
    pub circuit: CircuitBreaker,
}

impl ProviderLink {
    pub fn new(name: impl Into<String>, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            name: name.into(),
            provider,
            circuit: CircuitBreaker::default(),
        }
    }

    pub fn with_circuit(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = circuit;
        self
    }
}

/// Why a chain run ended without output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("all providers in the chain failed")]
    AllProvidersFailed,

    #[error("budget exhausted before a provider succeeded")]
    BudgetExhausted,

    #[error("request was cancelled")]
    Cancelled,
}

/// Telemetry and outcome of one chain run.
#[derive(Debug)]
pub struct ChainRun {
    pub outcome: Result<String, ChainError>,
    /// Providers attempted, in chain order (skipped-open links excluded).
    pub providers_tried: Vec<String>,
    /// Total provider attempts made, across all links.
    pub attempts: u32,
    /// Whether any link beyond the first configured one was used.
    pub fallback_used: bool,
}

/// Ordered list of provider links with per-link circuit state.
///
/// The chain is the unit of cross-request sharing: one instance per agent,
/// shared by all concurrent requests routed to that agent.
pub struct FallbackChain {
    name: String,
    links: Vec<ProviderLink>,
    journal: Mutex<VecDeque<FallbackRecord>>,
}

impl FallbackChain {
    pub fn new(name: impl Into<String>, links: Vec<ProviderLink>) -> Self {
        Self {
            name: name.into(),
            links,
            journal: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link names in configured order.
    pub fn link_names(&self) -> Vec<String> {
        self.links.iter().map(|l| l.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Most recent failover records, oldest first.
    pub fn recent_records(&self, limit: usize) -> Vec<FallbackRecord> {
        let journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        let start = journal.len().saturating_sub(limit);
        journal.iter().skip(start).cloned().collect()
    }

    fn record_failover(&self, record: FallbackRecord) {
        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        journal.push_back(record);
        while journal.len() > MAX_JOURNAL_RECORDS {
            journal.pop_front();
        }
    }

    /// Run the chain for one request, streaming tokens into `sink`.
    ///
    /// `deadline` bounds every attempt: each provider call gets the remaining
    /// slice as its timeout, and an expired deadline (or exhausted iteration
    /// budget) ends the run with `BudgetExhausted`.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        budget: &Budget,
        sink: &dyn EventSink,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ChainRun {
        let mut providers_tried: Vec<String> = Vec::new();
        let mut attempts = 0u32;
        let mut last_error_kind = "unavailable";

        for (index, link) in self.links.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.finish(Err(ChainError::Cancelled), providers_tried, attempts, index);
            }
            if !link.circuit.try_acquire() {
                tracing::debug!(
                    chain = %self.name,
                    provider = %link.name,
                    "Skipping link with open circuit"
                );
                continue;
            }

            if let Some(previous) = providers_tried.last() {
                sink.emit(Event::ProviderSwitch {
                    from: previous.clone(),
                    to: link.name.clone(),
                    reason: last_error_kind.to_string(),
                });
            }
            providers_tried.push(link.name.clone());

            let mut link_attempts = 0u32;
            loop {
                if attempts >= budget.max_total_iterations || Instant::now() >= deadline {
                    return self.finish(
                        Err(ChainError::BudgetExhausted),
                        providers_tried,
                        attempts,
                        index,
                    );
                }
                if cancel.is_cancelled() {
                    return self.finish(
                        Err(ChainError::Cancelled),
                        providers_tried,
                        attempts,
                        index,
                    );
                }

                attempts += 1;
                link_attempts += 1;

                let slice = deadline.saturating_duration_since(Instant::now());
                let call = link.provider.generate_stream(prompt, budget, sink);
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        return self.finish(
                            Err(ChainError::Cancelled),
                            providers_tried,
                            attempts,
                            index,
                        );
                    }
                    attempt = tokio::time::timeout(slice, call) => match attempt {
                        Ok(inner) => inner,
                        // The slice is the time remaining until the deadline,
                        // so its expiry is a budget breach, not the provider's
                        // fault; the link's circuit is left untouched.
                        Err(_) => {
                            return self.finish(
                                Err(ChainError::BudgetExhausted),
                                providers_tried,
                                attempts,
                                index,
                            );
                        }
                    },
                };

                match result {
                    Ok(text) => {
                        link.circuit.record_success();
                        tracing::info!(
                            chain = %self.name,
                            provider = %link.name,
                            attempts,
                            "Chain run succeeded"
                        );
                        return self.finish(Ok(text), providers_tried, attempts, index);
                    }
                    Err(err) => {
                        last_error_kind = err.kind_str();
                        tracing::warn!(
                            chain = %self.name,
                            provider = %link.name,
                            attempt = link_attempts,
                            error = %err,
                            "Provider attempt failed"
                        );

                        if err.is_retryable() && link_attempts < budget.max_attempts_per_provider
                        {
                            let delay = err
                                .suggested_delay(link_attempts.saturating_sub(1))
                                .min(deadline.saturating_duration_since(Instant::now()));
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    return self.finish(
                                        Err(ChainError::Cancelled),
                                        providers_tried,
                                        attempts,
                                        index,
                                    );
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }

                        // Link exhausted: record the failure and advance.
                        let retry_after = match &err {
                            ProviderError::RateLimited { retry_after, .. } => *retry_after,
                            _ => None,
                        };
                        let cooldown = link.circuit.record_failure(retry_after);
                        self.record_failover(FallbackRecord {
                            timestamp: chrono::Utc::now(),
                            chain: self.name.clone(),
                            from_provider: link.name.clone(),
                            reason: err.kind_str().to_string(),
                            cooldown_secs: cooldown.map(|d| d.as_secs_f64()),
                            link_position: index as u32 + 1,
                            chain_length: self.links.len() as u32,
                        });
                        break;
                    }
                }
            }
        }

        tracing::warn!(chain = %self.name, attempts, "All providers exhausted");
        let last_index = self.links.len().saturating_sub(1);
        self.finish(
            Err(ChainError::AllProvidersFailed),
            providers_tried,
            attempts,
            last_index,
        )
    }

    fn finish(
        &self,
        outcome: Result<String, ChainError>,
        providers_tried: Vec<String>,
        attempts: u32,
        link_index: usize,
    ) -> ChainRun {
        ChainRun {
            outcome,
            providers_tried,
            attempts,
            fallback_used: link_index > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BackoffConfig;
    use crate::event::MemorySink;
    use crate::provider::{ScriptedProvider, ScriptedStep};

    fn budget() -> Budget {
        Budget {
            max_total_iterations: 10,
            max_attempts_per_provider: 1,
            max_wall_time: Duration::from_secs(5),
            max_tokens: None,
        }
    }

    fn deadline_for(budget: &Budget) -> Instant {
        Instant::now() + budget.max_wall_time
    }

    #[tokio::test]
    async fn falls_through_to_second_link() {
        let chain = FallbackChain::new(
            "test",
            vec![
                ProviderLink::new(
                    "primary",
                    Arc::new(ScriptedProvider::new(vec![ScriptedStep::Fail(
                        ProviderError::Timeout,
                    )])),
                ),
                ProviderLink::new("secondary", Arc::new(ScriptedProvider::responder("hello"))),
            ],
        );
        let budget = budget();
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        assert_eq!(run.outcome.unwrap(), "hello");
        assert_eq!(run.providers_tried, vec!["primary", "secondary"]);
        assert!(run.fallback_used);
        assert_eq!(run.attempts, 2);

        // The switch is signaled explicitly, with the failure reason.
        let switches: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::ProviderSwitch { .. }))
            .collect();
        assert_eq!(switches.len(), 1);
        match &switches[0] {
            Event::ProviderSwitch { from, to, reason } => {
                assert_eq!(from, "primary");
                assert_eq!(to, "secondary");
                assert_eq!(reason, "timeout");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_advances_without_retry() {
        let primary = Arc::new(ScriptedProvider::always_failing(
            ProviderError::Unauthorized("bad key".into()),
        ));
        let chain = FallbackChain::new(
            "test",
            vec![ProviderLink::new("primary", Arc::clone(&primary) as Arc<dyn ProviderClient>)],
        );
        let mut budget = budget();
        budget.max_attempts_per_provider = 5;
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        assert_eq!(run.outcome.unwrap_err(), ChainError::AllProvidersFailed);
        // Unauthorized is non-retryable: exactly one attempt despite the
        // per-provider allowance of 5.
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn retryable_error_retries_within_link() {
        let primary = Arc::new(ScriptedProvider::new(vec![
            // retry_after keeps the backoff sleep short for the test
            ScriptedStep::Fail(ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(10)),
                message: "slow down".into(),
            }),
            ScriptedStep::Respond("recovered".into()),
        ]));
        let chain = FallbackChain::new(
            "test",
            vec![ProviderLink::new("primary", Arc::clone(&primary) as Arc<dyn ProviderClient>)],
        );
        let mut budget = budget();
        budget.max_attempts_per_provider = 3;
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        assert_eq!(run.outcome.unwrap(), "recovered");
        assert_eq!(primary.calls(), 2);
        assert!(!run.fallback_used);
        // Recovery within one link is not a provider switch.
        assert!(sink
            .events()
            .iter()
            .all(|e| !matches!(e, Event::ProviderSwitch { .. })));
    }

    #[tokio::test]
    async fn open_circuit_is_skipped_without_attempt() {
        let primary = Arc::new(ScriptedProvider::responder("never called"));
        let fast_open = CircuitBreaker::new(BackoffConfig {
            base_delay: Duration::from_secs(60),
            failure_threshold: 1,
            ..BackoffConfig::default()
        });
        fast_open.record_failure(None);

        let chain = FallbackChain::new(
            "test",
            vec![
                ProviderLink::new("primary", Arc::clone(&primary) as Arc<dyn ProviderClient>)
                    .with_circuit(fast_open),
                ProviderLink::new("secondary", Arc::new(ScriptedProvider::responder("ok"))),
            ],
        );
        let budget = budget();
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        assert_eq!(run.outcome.unwrap(), "ok");
        assert_eq!(run.providers_tried, vec!["secondary"]);
        assert!(run.fallback_used);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn hanging_provider_times_out_against_deadline() {
        let chain = FallbackChain::new(
            "test",
            vec![ProviderLink::new(
                "primary",
                Arc::new(ScriptedProvider::new(vec![ScriptedStep::Hang])),
            )],
        );
        let budget = Budget {
            max_total_iterations: 10,
            max_attempts_per_provider: 1,
            max_wall_time: Duration::from_millis(100),
            max_tokens: None,
        };
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        // The attempt is cut at the deadline and reported as a budget breach.
        assert_eq!(run.outcome.unwrap_err(), ChainError::BudgetExhausted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn journal_records_failovers() {
        let chain = FallbackChain::new(
            "test",
            vec![
                ProviderLink::new(
                    "primary",
                    Arc::new(ScriptedProvider::new(vec![ScriptedStep::Fail(
                        ProviderError::InvalidResponse("garbage".into()),
                    )])),
                ),
                ProviderLink::new("secondary", Arc::new(ScriptedProvider::responder("ok"))),
            ],
        );
        let budget = budget();
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let _ = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        let records = chain.recent_records(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from_provider, "primary");
        assert_eq!(records[0].reason, "invalid_response");
        assert_eq!(records[0].link_position, 1);
        assert_eq!(records[0].chain_length, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let chain = FallbackChain::new(
            "test",
            vec![ProviderLink::new(
                "primary",
                Arc::new(ScriptedProvider::new(vec![ScriptedStep::Hang])),
            )],
        );
        let budget = Budget {
            max_total_iterations: 10,
            max_attempts_per_provider: 3,
            max_wall_time: Duration::from_secs(60),
            max_tokens: None,
        };
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let run = chain
            .generate_stream("hi", &budget, &sink, deadline_for(&budget), &cancel)
            .await;

        assert_eq!(run.outcome.unwrap_err(), ChainError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
