//! Flat-file snapshot of known agents and duty-group definitions.
//!
//! The whole snapshot is rewritten on every mutation. A missing or
//! unparsable file loads as an empty store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::duties::DutyGroup;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub username: String,
    pub server_address: String,
    #[serde(default = "default_auth")]
    pub auth_method: String,
    pub state: AgentState,
    /// Name of the duty group the agent is working, if any.
    #[serde(default)]
    pub farm: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub(crate) fn default_auth() -> String {
    "offline".to_string()
}

/// Partial update applied by [`StateStore::update_bot`].
#[derive(Debug, Clone, Default)]
pub struct AgentRecordPatch {
    pub state: Option<AgentState>,
    /// `Some(None)` clears the assignment.
    pub farm: Option<Option<String>>,
    pub server_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub bots: Vec<AgentRecord>,
    #[serde(default)]
    pub farms: Vec<DutyGroup>,
}

/// Shared store; every mutation holds the lock across the file write.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = load_snapshot(&path);
        Self {
            path,
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    pub fn get_bot(&self, username: &str) -> Option<AgentRecord> {
        self.snapshot
            .lock()
            .bots
            .iter()
            .find(|b| b.username == username)
            .cloned()
    }

    pub fn bots(&self) -> Vec<AgentRecord> {
        self.snapshot.lock().bots.clone()
    }

    pub fn running_bots(&self) -> Vec<AgentRecord> {
        self.snapshot
            .lock()
            .bots
            .iter()
            .filter(|b| b.state == AgentState::Running)
            .cloned()
            .collect()
    }

    /// Insert or replace the record for `record.username`.
    pub fn upsert_bot(&self, mut record: AgentRecord) -> Result<()> {
        record.updated_at = Some(Utc::now());
        let mut snapshot = self.snapshot.lock();
        match snapshot.bots.iter_mut().find(|b| b.username == record.username) {
            Some(existing) => *existing = record,
            None => snapshot.bots.push(record),
        }
        self.persist(&snapshot)
    }

    /// Apply `patch` to an existing record. Returns false if there is none.
    pub fn update_bot(&self, username: &str, patch: AgentRecordPatch) -> Result<bool> {
        let mut snapshot = self.snapshot.lock();
        let Some(bot) = snapshot.bots.iter_mut().find(|b| b.username == username) else {
            return Ok(false);
        };
        if let Some(state) = patch.state {
            bot.state = state;
        }
        if let Some(farm) = patch.farm {
            bot.farm = farm;
        }
        if let Some(address) = patch.server_address {
            bot.server_address = address;
        }
        bot.updated_at = Some(Utc::now());
        self.persist(&snapshot)?;
        Ok(true)
    }

    pub fn remove_bot(&self, username: &str) -> Result<bool> {
        let mut snapshot = self.snapshot.lock();
        let before = snapshot.bots.len();
        snapshot.bots.retain(|b| b.username != username);
        if snapshot.bots.len() == before {
            return Ok(false);
        }
        self.persist(&snapshot)?;
        Ok(true)
    }

    pub fn get_farm(&self, name: &str) -> Option<DutyGroup> {
        self.snapshot
            .lock()
            .farms
            .iter()
            .find(|f| f.name == name)
            .cloned()
    }

    pub fn add_farm(&self, farm: DutyGroup) -> Result<()> {
        let mut snapshot = self.snapshot.lock();
        match snapshot.farms.iter_mut().find(|f| f.name == farm.name) {
            Some(existing) => *existing = farm,
            None => snapshot.farms.push(farm),
        }
        self.persist(&snapshot)
    }

    pub fn update_farm(&self, name: &str, update: impl FnOnce(&mut DutyGroup)) -> Result<bool> {
        let mut snapshot = self.snapshot.lock();
        let Some(farm) = snapshot.farms.iter_mut().find(|f| f.name == name) else {
            return Ok(false);
        };
        update(farm);
        self.persist(&snapshot)?;
        Ok(true)
    }

    pub fn remove_farm(&self, name: &str) -> Result<bool> {
        let mut snapshot = self.snapshot.lock();
        let before = snapshot.farms.len();
        snapshot.farms.retain(|f| f.name != name);
        if snapshot.farms.len() == before {
            return Ok(false);
        }
        self.persist(&snapshot)?;
        Ok(true)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Snapshot {
    let Ok(data) = fs::read(path) else {
        return Snapshot::default();
    };
    match serde_json::from_slice(&data) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            tracing::warn!(
                target = "agent_fleet::state",
                path = %path.display(),
                error = %error,
                "state file unreadable, starting empty"
            );
            Snapshot::default()
        }
    }
}
