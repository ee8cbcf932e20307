//! Agent descriptors and the registry.
//!
//! [`AgentSpec`]s are registered at startup and read-only thereafter. The
//! registry publishes immutable snapshots: an update builds a whole new
//! [`RegistrySnapshot`] and swaps it in atomically, so readers always see
//! either the fully-old or fully-new set, never a partial one.

pub mod catalog;

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::FallbackChain;

/// Ceiling on the task complexity an agent accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
    Expert,
}

/// Static descriptor of one specialized capability.
pub struct AgentSpec {
    /// Unique registry key.
    pub name: String,
    /// Tags matched against request text during routing. Order-stable set
    /// so routing stays deterministic.
    pub capability_tags: BTreeSet<String>,
    /// Tools this agent may invoke.
    pub tool_allowlist: BTreeSet<String>,
    pub max_complexity: Complexity,
    /// Provider chain used to satisfy requests routed here.
    pub chain: Arc<FallbackChain>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, chain: Arc<FallbackChain>) -> Self {
        Self {
            name: name.into(),
            capability_tags: BTreeSet::new(),
            tool_allowlist: BTreeSet::new(),
            max_complexity: Complexity::default(),
            chain,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_allowlist = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_complexity(mut self, complexity: Complexity) -> Self {
        self.max_complexity = complexity;
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry must contain at least one agent")]
    Empty,

    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("default agent not found in registry: {0}")]
    UnknownDefault(String),
}

/// Immutable view of the registered agents.
///
/// Registration order is preserved; routing tie-breaks are
/// first-registered-wins.
pub struct RegistrySnapshot {
    agents: Vec<Arc<AgentSpec>>,
    default_index: usize,
}

impl RegistrySnapshot {
    /// Build a snapshot, validating uniqueness and the default agent.
    pub fn new(
        agents: Vec<Arc<AgentSpec>>,
        default_agent: &str,
    ) -> Result<Self, RegistryError> {
        if agents.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut seen = BTreeSet::new();
        for agent in &agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(RegistryError::DuplicateAgent(agent.name.clone()));
            }
        }
        let default_index = agents
            .iter()
            .position(|a| a.name == default_agent)
            .ok_or_else(|| RegistryError::UnknownDefault(default_agent.to_string()))?;
        Ok(Self {
            agents,
            default_index,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentSpec>> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// The designated fallback agent; routing never fails.
    pub fn default_agent(&self) -> &Arc<AgentSpec> {
        &self.agents[self.default_index]
    }

    /// Agents in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        self.agents.iter()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Shared handle over the current registry snapshot.
///
/// The lock guards only the `Arc` swap; readers clone the `Arc` and drop
/// the guard immediately, so a slow request never blocks an update.
pub struct AgentRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl AgentRegistry {
    pub fn new(snapshot: Arc<RegistrySnapshot>) -> Self {
        Self {
            current: RwLock::new(snapshot),
        }
    }

    /// Current snapshot. Stable for the lifetime of the returned `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    /// Atomically publish a new snapshot.
    pub fn replace(&self, snapshot: Arc<RegistrySnapshot>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(agents = snapshot.len(), "Publishing new agent registry");
        *current = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::chain::ProviderLink;

    fn spec(name: &str) -> Arc<AgentSpec> {
        let chain = Arc::new(FallbackChain::new(
            name,
            vec![ProviderLink::new(
                "local",
                Arc::new(ScriptedProvider::responder("ok")),
            )],
        ));
        Arc::new(AgentSpec::new(name, chain))
    }

    #[test]
    fn snapshot_validates_default_and_uniqueness() {
        assert!(matches!(
            RegistrySnapshot::new(vec![], "a"),
            Err(RegistryError::Empty)
        ));
        assert!(matches!(
            RegistrySnapshot::new(vec![spec("a"), spec("a")], "a"),
            Err(RegistryError::DuplicateAgent(_))
        ));
        assert!(matches!(
            RegistrySnapshot::new(vec![spec("a")], "missing"),
            Err(RegistryError::UnknownDefault(_))
        ));

        let snap = RegistrySnapshot::new(vec![spec("a"), spec("b")], "b").unwrap();
        assert_eq!(snap.default_agent().name, "b");
        assert!(snap.get("a").is_some());
        assert!(snap.get("c").is_none());
    }

    #[test]
    fn replace_swaps_whole_snapshot() {
        let registry = AgentRegistry::new(Arc::new(
            RegistrySnapshot::new(vec![spec("old")], "old").unwrap(),
        ));
        let before = registry.snapshot();

        registry.replace(Arc::new(
            RegistrySnapshot::new(vec![spec("new_a"), spec("new_b")], "new_a").unwrap(),
        ));

        // The old snapshot stays valid for readers that hold it.
        assert!(before.get("old").is_some());

        let after = registry.snapshot();
        assert!(after.get("old").is_none());
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn complexity_ordering() {
        assert!(Complexity::Simple < Complexity::Moderate);
        assert!(Complexity::Complex < Complexity::Expert);
    }
}
