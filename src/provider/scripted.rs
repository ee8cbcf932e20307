//! Deterministic in-process provider.
//!
//! Plays back a scripted sequence of outcomes. Serves two purposes: the
//! local last-resort responder in chains with no healthy remote backend,
//! and a controllable test double for chain/supervisor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::event::{Event, EventSink};
use crate::provider::{ProviderClient, ProviderError};
use crate::request::Budget;

/// One scripted outcome for a provider attempt.
#[derive(Debug)]
pub enum ScriptedStep {
    /// Respond immediately with the given text.
    Respond(String),
    /// Sleep, then respond.
    RespondAfter(Duration, String),
    /// Fail with the given error.
    Fail(ProviderError),
    /// Never respond within any reasonable budget.
    Hang,
}

/// Provider that consumes [`ScriptedStep`]s in order.
///
/// Once the script is exhausted, every further attempt returns the fixed
/// fallback response (or `Unavailable` if none was configured).
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
    exhausted_response: Option<String>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            exhausted_response: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Provider that always responds with `text`.
    pub fn responder(text: impl Into<String>) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            exhausted_response: Some(text.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Provider that always fails with the given error.
    pub fn always_failing(error: ProviderError) -> Self {
        // An empty script with no fallback response reports Unavailable,
        // so pre-load a generous number of identical failures instead.
        let steps = (0..64).map(|_| ScriptedStep::Fail(error.clone())).collect();
        Self::new(steps)
    }

    /// Respond with `text` once the script runs out.
    pub fn with_exhausted_response(mut self, text: impl Into<String>) -> Self {
        self.exhausted_response = Some(text.into());
        self
    }

    /// Number of attempts made against this provider.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<ScriptedStep> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    async fn play(&self) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Some(ScriptedStep::Respond(text)) => Ok(text),
            Some(ScriptedStep::RespondAfter(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(ScriptedStep::Fail(err)) => Err(err),
            Some(ScriptedStep::Hang) => {
                // Far beyond any sane wall-time budget; the chain's deadline
                // slice cuts the attempt off long before this completes.
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(ProviderError::Timeout)
            }
            None => match &self.exhausted_response {
                Some(text) => Ok(text.clone()),
                None => Err(ProviderError::Unavailable("script exhausted".into())),
            },
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn generate(&self, _prompt: &str, _budget: &Budget) -> Result<String, ProviderError> {
        self.play().await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        budget: &Budget,
        sink: &dyn EventSink,
    ) -> Result<String, ProviderError> {
        let text = self.generate(prompt, budget).await?;
        // Stream word by word so ordering and gating paths get exercised.
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        for word in words {
            sink.emit(Event::Token {
                text: word.to_string(),
            });
        }
        Ok(text)
    }
}
