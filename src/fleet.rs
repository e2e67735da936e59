//! Top-level controller: owns the shared services and one
//! [`ConnectionManager`] per agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{Account, ServerEndpoint};
use crate::connection::{AgentProfile, ConnectionManager, FleetServices};

#[derive(Clone)]
pub struct Fleet {
    services: FleetServices,
    agents: Arc<Mutex<BTreeMap<String, ConnectionManager>>>,
    cleanup: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Fleet {
    /// Take ownership of the services and start the dedup cleanup task.
    pub fn new(services: FleetServices) -> Self {
        let cleanup = services.dedup.spawn_cleanup(
            services.settings.dedup_cleanup_interval,
            services.shutdown.child_token(),
        );
        Self {
            services,
            agents: Arc::new(Mutex::new(BTreeMap::new())),
            cleanup: Arc::new(Mutex::new(Some(cleanup))),
        }
    }

    pub fn services(&self) -> &FleetServices {
        &self.services
    }

    pub fn agent(&self, username: &str) -> Option<ConnectionManager> {
        self.agents.lock().get(username).cloned()
    }

    pub fn agents(&self) -> Vec<ConnectionManager> {
        self.agents.lock().values().cloned().collect()
    }

    /// The manager for `profile.username`, created on first use.
    pub fn add_agent(&self, profile: AgentProfile) -> ConnectionManager {
        self.agents
            .lock()
            .entry(profile.username.clone())
            .or_insert_with(|| ConnectionManager::new(profile, self.services.clone()))
            .clone()
    }

    /// Agents recorded as running by an earlier session. Configured accounts
    /// supply credentials; unknown ones reconnect with what the record says.
    pub fn resume_profiles(&self, accounts: &[Account], endpoint: &ServerEndpoint) -> Vec<AgentProfile> {
        self.services
            .state
            .running_bots()
            .into_iter()
            .map(|record| {
                match accounts.iter().find(|a| a.username == record.username) {
                    Some(account) => profile_for(account, endpoint),
                    None => AgentProfile {
                        username: record.username,
                        host: record.server_address,
                        port: endpoint.port,
                        version: endpoint.version.clone(),
                        auth: record.auth_method,
                        password: None,
                    },
                }
            })
            .collect()
    }

    /// Connect each profile in turn, waiting the stagger delay between them.
    /// Stops early on shutdown.
    pub async fn launch(&self, profiles: Vec<AgentProfile>) {
        let stagger = self.services.settings.stagger;
        for (index, profile) in profiles.into_iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = self.services.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(stagger) => {}
                }
            }
            if self.services.shutdown.is_cancelled() {
                return;
            }
            tracing::info!(target = "agent_fleet::fleet", agent = %profile.username, "launching agent");
            self.add_agent(profile).connect().await;
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!(target = "agent_fleet::fleet", agents = self.agents.lock().len(), "shutting down fleet");
        self.services.shutdown.cancel();
        for agent in self.agents() {
            agent.shutdown().await;
        }
        let cleanup = self.cleanup.lock().take();
        if let Some(task) = cleanup {
            let _ = task.await;
        }
    }
}

pub fn profile_for(account: &Account, endpoint: &ServerEndpoint) -> AgentProfile {
    AgentProfile {
        username: account.username.clone(),
        host: endpoint.host.clone(),
        port: endpoint.port,
        version: endpoint.version.clone(),
        auth: account.auth.clone(),
        password: account.password.clone(),
    }
}

/// Resumed agents first, then the launch list, each username once.
pub fn merge_profiles(resumed: Vec<AgentProfile>, launch: Vec<AgentProfile>) -> Vec<AgentProfile> {
    let mut merged: Vec<AgentProfile> = Vec::with_capacity(resumed.len() + launch.len());
    for profile in resumed.into_iter().chain(launch) {
        if !merged.iter().any(|p| p.username == profile.username) {
            merged.push(profile);
        }
    }
    merged
}
