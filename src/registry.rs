//! Process-wide view of connected agents and the single primary designation.
//!
//! The primary agent is the one that logs public chat on behalf of the fleet.
//! When it leaves, the longest-registered remaining agent takes over.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Metadata supplied when an agent registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMeta {
    pub host: String,
    pub has_duty_group: bool,
}

/// Partial update for [`AgentRegistry::update_bot`].
#[derive(Debug, Clone, Default)]
pub struct AgentMetaPatch {
    pub host: Option<String>,
    pub has_duty_group: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub username: String,
    pub host: String,
    pub has_duty_group: bool,
    pub is_primary: bool,
    pub registered_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    primary: Option<String>,
    next_seq: u64,
}

impl RegistryState {
    fn remove(&mut self, username: &str) -> Option<String> {
        let removed = self.entries.remove(username)?;
        if !removed.is_primary {
            return None;
        }

        self.primary = None;
        let successor = self
            .entries
            .values()
            .min_by_key(|e| (e.registered_at, e.seq))
            .map(|e| e.username.clone())?;

        if let Some(entry) = self.entries.get_mut(&successor) {
            entry.is_primary = true;
        }
        self.primary = Some(successor.clone());
        Some(successor)
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username`; returns true iff the registry was empty, in which
    /// case this agent becomes primary. Re-registering replaces the old entry.
    pub fn register_bot(&self, username: &str, meta: AgentMeta) -> bool {
        self.register_bot_at(username, meta, Instant::now())
    }

    pub fn register_bot_at(&self, username: &str, meta: AgentMeta, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(username) {
            state.remove(username);
        }

        let is_first = state.entries.is_empty();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            username.to_string(),
            RegistryEntry {
                username: username.to_string(),
                host: meta.host,
                has_duty_group: meta.has_duty_group,
                is_primary: is_first,
                registered_at: now,
                seq,
            },
        );

        if is_first {
            state.primary = Some(username.to_string());
            tracing::info!(target = "agent_fleet::registry", agent = %username, "registered as primary agent");
        }
        is_first
    }

    pub fn remove_bot(&self, username: &str) {
        let mut state = self.state.lock();
        if let Some(successor) = state.remove(username) {
            tracing::info!(
                target = "agent_fleet::registry",
                previous = %username,
                agent = %successor,
                "primary agent re-elected"
            );
        }
    }

    pub fn update_bot(&self, username: &str, patch: AgentMetaPatch) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(username) {
            if let Some(host) = patch.host {
                entry.host = host;
            }
            if let Some(has_duty_group) = patch.has_duty_group {
                entry.has_duty_group = has_duty_group;
            }
        }
    }

    pub fn is_first_bot(&self, username: &str) -> bool {
        self.state.lock().primary.as_deref() == Some(username)
    }

    pub fn primary(&self) -> Option<String> {
        self.state.lock().primary.clone()
    }

    pub fn get_bot(&self, username: &str) -> Option<RegistryEntry> {
        self.state.lock().entries.get(username).cloned()
    }

    /// All entries in registration order.
    pub fn get_all_bots(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn get_bot_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}
