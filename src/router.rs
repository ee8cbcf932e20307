//! Agent selection.
//!
//! Routing is a pure function of the request and a registry snapshot:
//! an explicit override wins when it names a registered agent, otherwise
//! capability tags are matched against the request text, otherwise the
//! default agent is returned. Routing never fails.

use std::sync::Arc;

use crate::agent::{AgentSpec, RegistrySnapshot};
use crate::request::Request;

pub struct Router;

impl Router {
    /// Select the agent for a request.
    ///
    /// Tag matching is case-insensitive substring search over the request
    /// text; ties go to the first-registered agent. An override naming an
    /// unknown agent falls through to tag matching rather than erroring —
    /// the caller always gets an agent back.
    pub fn select(request: &Request, registry: &RegistrySnapshot) -> Arc<AgentSpec> {
        if let Some(name) = &request.agent_override {
            if let Some(agent) = registry.get(name) {
                tracing::debug!(request_id = %request.id, agent = %name, "Routing via explicit override");
                return Arc::clone(agent);
            }
            tracing::debug!(
                request_id = %request.id,
                agent = %name,
                "Override names unknown agent, falling back to tag routing"
            );
        }

        let text = request.text.to_lowercase();
        for agent in registry.iter() {
            if agent
                .capability_tags
                .iter()
                .any(|tag| text.contains(&tag.to_lowercase()))
            {
                tracing::debug!(request_id = %request.id, agent = %agent.name, "Routing via capability tag");
                return Arc::clone(agent);
            }
        }

        let default = registry.default_agent();
        tracing::debug!(request_id = %request.id, agent = %default.name, "Routing to default agent");
        Arc::clone(default)
    }
}
