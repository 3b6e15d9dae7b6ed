//! Agent directory: who exists, where they live, who hosts them.
//!
//! Built once from configuration at startup and read-only afterwards, so
//! lookups need no locking. A rebuild requires a proxy restart.

use std::collections::{BTreeSet, HashMap};

use crate::config::Config;

/// One agent known to the network.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub id: String,
    pub group: String,
    /// `host:port` of the agent process; `None` when the agent is remote.
    pub host_port: Option<String>,
    pub hosting_proxy_id: String,
    pub capabilities: Vec<String>,
    pub agent_card_endpoint: String,
}

pub struct AgentDirectory {
    proxy_id: String,
    agents: HashMap<String, AgentEntry>,
}

impl AgentDirectory {
    pub fn from_config(config: &Config) -> Self {
        let agents = config
            .agents
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    AgentEntry {
                        id: a.id.clone(),
                        group: a.group.clone(),
                        host_port: a.host_port.clone(),
                        hosting_proxy_id: a.proxy_id.clone(),
                        capabilities: a.capabilities.clone(),
                        agent_card_endpoint: a.agent_card_endpoint.clone(),
                    },
                )
            })
            .collect();
        Self {
            proxy_id: config.proxy.id.clone(),
            agents,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.agents.get(agent_id)
    }

    /// True iff this proxy hosts the agent and can reach it over HTTP.
    pub fn is_local(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|a| a.hosting_proxy_id == self.proxy_id && a.host_port.is_some())
    }

    pub fn group_of(&self, agent_id: &str) -> Option<&str> {
        self.agents.get(agent_id).map(|a| a.group.as_str())
    }

    /// Agents this proxy hosts, i.e. the ones needing a request receiver.
    pub fn hosted_agents(&self) -> Vec<&AgentEntry> {
        let mut hosted: Vec<&AgentEntry> = self
            .agents
            .values()
            .filter(|a| a.hosting_proxy_id == self.proxy_id && a.host_port.is_some())
            .collect();
        hosted.sort_by(|a, b| a.id.cmp(&b.id));
        hosted
    }

    pub fn hosted_groups(&self) -> Vec<String> {
        self.hosted_agents()
            .iter()
            .map(|a| a.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every group any known agent belongs to.
    pub fn groups(&self) -> Vec<String> {
        self.agents
            .values()
            .map(|a| a.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
