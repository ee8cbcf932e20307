//! Request, budget, and dispatch result types.
//!
//! A [`Request`] is constructed by the boundary layer (HTTP handler, CLI) and
//! owned by exactly one supervisor run. It is immutable once built.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Caller-specified bounds for one request.
///
/// # Invariants
/// - All counts are > 0 (enforced by [`Budget::new`])
/// - A run exceeding any dimension terminates with `BudgetExceeded`, never hangs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum provider attempts across the whole request.
    pub max_total_iterations: u32,

    /// Maximum attempts per fallback-chain link before advancing.
    pub max_attempts_per_provider: u32,

    /// Wall-clock ceiling for the whole request.
    pub max_wall_time: Duration,

    /// Optional cap on streamed output tokens.
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget field {0} must be greater than zero")]
    ZeroField(&'static str),
}

impl Budget {
    /// Create a validated budget.
    pub fn new(
        max_total_iterations: u32,
        max_attempts_per_provider: u32,
        max_wall_time: Duration,
        max_tokens: Option<u64>,
    ) -> Result<Self, BudgetError> {
        if max_total_iterations == 0 {
            return Err(BudgetError::ZeroField("max_total_iterations"));
        }
        if max_attempts_per_provider == 0 {
            return Err(BudgetError::ZeroField("max_attempts_per_provider"));
        }
        if max_wall_time.is_zero() {
            return Err(BudgetError::ZeroField("max_wall_time"));
        }
        if max_tokens == Some(0) {
            return Err(BudgetError::ZeroField("max_tokens"));
        }
        Ok(Self {
            max_total_iterations,
            max_attempts_per_provider,
            max_wall_time,
            max_tokens,
        })
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_total_iterations: 20,
            max_attempts_per_provider: 3,
            max_wall_time: Duration::from_secs(120),
            max_tokens: None,
        }
    }
}

/// One end-to-end dispatch request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request ID (tags log records and events).
    pub id: Uuid,

    /// The user's message text.
    pub text: String,

    /// Conversation this request belongs to, if any.
    pub conversation_id: Option<Uuid>,

    /// Explicit agent choice; wins over routing when present in the registry.
    pub agent_override: Option<String>,

    /// Already-authorized caller context (identity, prior turns, etc.).
    pub context: HashMap<String, serde_json::Value>,

    /// Bounds for this request.
    pub budget: Budget,
}

impl Request {
    /// Create a request with a fresh ID and default budget.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            conversation_id: None,
            agent_override: None,
            context: HashMap::new(),
            budget: Budget::default(),
        }
    }

    /// Set the budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Set an explicit agent override.
    pub fn with_agent_override(mut self, agent: impl Into<String>) -> Self {
        self.agent_override = Some(agent.into());
        self
    }

    /// Attach the conversation this request continues.
    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Terminal status of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// First configured link satisfied the request.
    Ok,
    /// A link beyond the first was used.
    FallbackUsed,
    /// An iteration/time/token bound was breached.
    BudgetExceeded,
    /// Every link in the chain was exhausted.
    AllProvidersFailed,
    /// The caller cancelled the request.
    Cancelled,
}

impl DispatchStatus {
    /// Whether the request produced usable output.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::FallbackUsed)
    }
}

/// Structured outcome of one supervisor run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub request_id: Uuid,
    pub final_text: String,
    /// Providers attempted, in chain order.
    pub provider_chain_used: Vec<String>,
    /// Total provider attempts made.
    pub attempts: u32,
    pub elapsed: Duration,
    pub status: DispatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rejects_zero_fields() {
        assert!(Budget::new(0, 1, Duration::from_secs(1), None).is_err());
        assert!(Budget::new(1, 0, Duration::from_secs(1), None).is_err());
        assert!(Budget::new(1, 1, Duration::ZERO, None).is_err());
        assert!(Budget::new(1, 1, Duration::from_secs(1), Some(0)).is_err());
        assert!(Budget::new(1, 1, Duration::from_secs(1), Some(1)).is_ok());
    }

    #[test]
    fn request_builder_sets_fields() {
        let req = Request::new("summarize this")
            .with_agent_override("researcher")
            .with_context("user", serde_json::json!("alice"));

        assert_eq!(req.agent_override.as_deref(), Some("researcher"));
        assert_eq!(req.context["user"], serde_json::json!("alice"));
        assert!(req.conversation_id.is_none());
    }

    #[test]
    fn status_success_classification() {
        assert!(DispatchStatus::Ok.is_success());
        assert!(DispatchStatus::FallbackUsed.is_success());
        assert!(!DispatchStatus::BudgetExceeded.is_success());
        assert!(!DispatchStatus::AllProvidersFailed.is_success());
        assert!(!DispatchStatus::Cancelled.is_success());
    }
}
