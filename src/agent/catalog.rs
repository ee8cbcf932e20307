//! On-disk agent catalog.
//!
//! Agent definitions are persisted as JSON and turned into a
//! [`RegistrySnapshot`] at startup (or on reload). Writes go to a temp file
//! followed by a rename so a crash never leaves a half-written catalog.
//! The catalog is deliberately decoupled from concrete backends: chain
//! entries name a provider and model, and the caller supplies the resolver
//! that maps them to [`ProviderClient`] instances.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::agent::{AgentSpec, Complexity, RegistryError, RegistrySnapshot};
use crate::chain::{FallbackChain, ProviderLink};
use crate::provider::ProviderClient;

/// One provider+model entry in an agent's chain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntryDef {
    /// Provider identifier (e.g. "openai", "local").
    pub provider: String,
    /// Model to request from that provider.
    pub model: String,
}

/// Persisted definition of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default)]
    pub max_complexity: Complexity,
    /// Ordered fallback entries (first = highest priority).
    pub chain: Vec<ChainEntryDef>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("catalog produced no usable agents")]
    NoUsableAgents,

    #[error("cannot delete the last remaining agent")]
    LastAgent,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Maps a catalog chain entry to a concrete provider client.
///
/// Returning `None` skips the entry (unknown provider, missing credentials).
pub type ProviderResolver<'a> =
    &'a dyn Fn(&ChainEntryDef) -> Option<Arc<dyn ProviderClient>>;

/// JSON-backed store of agent definitions.
pub struct AgentCatalog {
    agents: RwLock<Vec<AgentDefinition>>,
    storage_path: PathBuf,
}

impl AgentCatalog {
    /// Open the catalog, loading existing definitions and seeding the
    /// builtin default agent if absent.
    pub async fn open(storage_path: PathBuf) -> Self {
        let catalog = Self {
            agents: RwLock::new(Vec::new()),
            storage_path,
        };

        match catalog.load_from_disk() {
            Ok(loaded) => {
                let mut agents = catalog.agents.write().await;
                *agents = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file yet; created on first write.
            }
            Err(e) => {
                tracing::error!(
                    "Failed to load agent catalog from {}: {}. Starting empty — \
                     user-defined agents may have been lost.",
                    catalog.storage_path.display(),
                    e
                );
            }
        }

        catalog.ensure_default_agent().await;
        catalog
    }

    /// Seed the builtin default agent.
    ///
    /// Idempotent: does nothing when an agent named `assistant` exists.
    /// Check and insert happen under one write lock.
    async fn ensure_default_agent(&self) {
        let mut agents = self.agents.write().await;
        if agents.iter().any(|a| a.name == "assistant") {
            return;
        }

        let now = chrono::Utc::now();
        agents.push(AgentDefinition {
            name: "assistant".to_string(),
            capability_tags: Vec::new(),
            tool_allowlist: Vec::new(),
            max_complexity: Complexity::Moderate,
            chain: vec![
                ChainEntryDef {
                    provider: "openai".to_string(),
                    model: "gpt-4o-mini".to_string(),
                },
                ChainEntryDef {
                    provider: "local".to_string(),
                    model: "scripted".to_string(),
                },
            ],
            is_default: true,
            created_at: now,
            updated_at: now,
        });

        if let Err(e) = self.save_to_disk(&agents) {
            tracing::error!("Failed to save default agent definition: {}", e);
        }
    }

    fn load_from_disk(&self) -> Result<Vec<AgentDefinition>, std::io::Error> {
        let contents = std::fs::read_to_string(&self.storage_path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Write `agents` atomically (temp file, then rename). Called while the
    /// caller holds the write lock so concurrent upserts cannot interleave.
    fn save_to_disk(&self, agents: &[AgentDefinition]) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(agents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.storage_path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.storage_path)?;
        Ok(())
    }

    /// All definitions in registration order.
    pub async fn list(&self) -> Vec<AgentDefinition> {
        self.agents.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<AgentDefinition> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    /// Add or update a definition. Setting `is_default` clears the flag on
    /// all other agents.
    pub async fn upsert(&self, mut definition: AgentDefinition) {
        definition.updated_at = chrono::Utc::now();
        let mut agents = self.agents.write().await;

        if definition.is_default {
            for agent in agents.iter_mut() {
                agent.is_default = false;
            }
        }

        if let Some(existing) = agents.iter_mut().find(|a| a.name == definition.name) {
            *existing = definition;
        } else {
            agents.push(definition);
        }

        if let Err(e) = self.save_to_disk(&agents) {
            tracing::error!("Failed to save agent catalog: {}", e);
        }
    }

    /// Delete a definition.
    ///
    /// Returns `Ok(false)` if not found; refuses to delete the last agent.
    /// Deleting the default promotes the first remaining agent.
    pub async fn delete(&self, name: &str) -> Result<bool, CatalogError> {
        let mut agents = self.agents.write().await;

        if !agents.iter().any(|a| a.name == name) {
            return Ok(false);
        }
        if agents.len() <= 1 {
            return Err(CatalogError::LastAgent);
        }

        let was_default = agents.iter().any(|a| a.name == name && a.is_default);
        agents.retain(|a| a.name != name);
        if was_default {
            if let Some(first) = agents.first_mut() {
                first.is_default = true;
            }
        }

        if let Err(e) = self.save_to_disk(&agents) {
            tracing::error!("Failed to save agent catalog after delete: {}", e);
        }
        Ok(true)
    }

    /// Build an immutable registry snapshot from the current definitions.
    ///
    /// Entries the resolver cannot map are skipped with a warning; an agent
    /// whose chain ends up empty is dropped. The snapshot is ready for
    /// atomic publication via [`crate::agent::AgentRegistry::replace`].
    pub async fn build_registry(
        &self,
        resolve: ProviderResolver<'_>,
    ) -> Result<Arc<RegistrySnapshot>, CatalogError> {
        let definitions = self.agents.read().await.clone();

        let mut specs: Vec<Arc<AgentSpec>> = Vec::new();
        let mut default_name: Option<String> = None;

        for definition in &definitions {
            let mut links = Vec::new();
            for entry in &definition.chain {
                match resolve(entry) {
                    Some(provider) => links.push(ProviderLink::new(
                        format!("{}/{}", entry.provider, entry.model),
                        provider,
                    )),
                    None => {
                        tracing::warn!(
                            agent = %definition.name,
                            provider = %entry.provider,
                            model = %entry.model,
                            "Unresolvable chain entry, skipping"
                        );
                    }
                }
            }
            if links.is_empty() {
                tracing::warn!(
                    agent = %definition.name,
                    "Agent has no resolvable providers, dropping"
                );
                continue;
            }

            if definition.is_default {
                default_name = Some(definition.name.clone());
            }
            specs.push(Arc::new(
                AgentSpec::new(
                    definition.name.clone(),
                    Arc::new(FallbackChain::new(definition.name.clone(), links)),
                )
                .with_tags(definition.capability_tags.clone())
                .with_tools(definition.tool_allowlist.clone())
                .with_max_complexity(definition.max_complexity),
            ));
        }

        let default_name = default_name
            .or_else(|| specs.first().map(|s| s.name.clone()))
            .ok_or(CatalogError::NoUsableAgents)?;

        Ok(Arc::new(RegistrySnapshot::new(specs, &default_name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn resolver(entry: &ChainEntryDef) -> Option<Arc<dyn ProviderClient>> {
        match entry.provider.as_str() {
            "local" | "openai" => Some(Arc::new(ScriptedProvider::responder("ok"))),
            _ => None,
        }
    }

    fn definition(name: &str, chain: Vec<ChainEntryDef>) -> AgentDefinition {
        let now = chrono::Utc::now();
        AgentDefinition {
            name: name.to_string(),
            capability_tags: vec!["code".to_string()],
            tool_allowlist: Vec::new(),
            max_complexity: Complexity::Moderate,
            chain,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn entry(provider: &str) -> ChainEntryDef {
        ChainEntryDef {
            provider: provider.to_string(),
            model: "m".to_string(),
        }
    }

    #[tokio::test]
    async fn seeds_default_agent_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");

        let catalog = AgentCatalog::open(path.clone()).await;
        assert_eq!(catalog.list().await.len(), 1);
        assert!(catalog.get("assistant").await.unwrap().is_default);

        // Reopen: still exactly one default.
        drop(catalog);
        let catalog = AgentCatalog::open(path).await;
        assert_eq!(catalog.list().await.len(), 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");

        let catalog = AgentCatalog::open(path.clone()).await;
        catalog
            .upsert(definition("coder", vec![entry("local")]))
            .await;
        drop(catalog);

        let reopened = AgentCatalog::open(path).await;
        let agents = reopened.list().await;
        assert_eq!(agents.len(), 2);
        assert!(reopened.get("coder").await.is_some());
    }

    #[tokio::test]
    async fn delete_refuses_last_agent_and_promotes_default() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = AgentCatalog::open(dir.path().join("agents.json")).await;
        catalog
            .upsert(definition("coder", vec![entry("local")]))
            .await;

        // Delete the default "assistant": "coder" gets promoted.
        assert!(catalog.delete("assistant").await.unwrap());
        assert!(catalog.get("coder").await.unwrap().is_default);

        assert!(matches!(
            catalog.delete("coder").await,
            Err(CatalogError::LastAgent)
        ));
        assert!(!catalog.delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn build_registry_skips_unresolvable_entries() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = AgentCatalog::open(dir.path().join("agents.json")).await;
        catalog
            .upsert(definition(
                "coder",
                vec![entry("unknown-backend"), entry("local")],
            ))
            .await;
        catalog
            .upsert(definition("ghost", vec![entry("unknown-backend")]))
            .await;

        let snapshot = catalog.build_registry(&resolver).await.unwrap();
        assert!(snapshot.get("coder").is_some());
        // Agent with no resolvable providers is dropped entirely.
        assert!(snapshot.get("ghost").is_none());
        assert_eq!(snapshot.default_agent().name, "assistant");

        let coder = snapshot.get("coder").unwrap();
        assert_eq!(coder.chain.link_names(), vec!["local/m"]);
    }
}
