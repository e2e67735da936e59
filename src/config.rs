use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::dedup::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_WINDOW};
use crate::duties::DutyGroup;
use crate::monitor::MonitorSettings;
use crate::notify::DEFAULT_COOLDOWN;
use crate::secure_settings::{
    SecureSettings, DEFAULT_PORT, DEFAULT_VERSION, GAME_VERSION, SERVER_ADDRESS, SERVER_PORT,
};
use crate::state::default_auth;
use crate::supervisor::ReconnectPolicy;
use crate::transport::Vec3;

pub const DEFAULT_COMMAND_PREFIX: &str = "fleet";
pub const DEFAULT_SIDECAR: &str = "127.0.0.1:3007";
pub const DEFAULT_LOBBY: Vec3 = Vec3::new(-71.0, 38.0, -5.0);

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-fleet")]
#[command(about = "Keeps a fleet of game-client agents connected, on duty and under remote control")]
pub struct Cli {
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, default_value = "cache.json", global = true)]
    pub state_file: PathBuf,

    #[arg(long, default_value = "secure_config.json", global = true)]
    pub settings_file: PathBuf,

    #[arg(long, default_value = "fleet.json", global = true)]
    pub launch_file: PathBuf,

    #[arg(long, default_value = "external_configs", global = true)]
    pub whitelist_dir: PathBuf,

    /// Also print lifecycle events as JSON lines on stderr.
    #[arg(long, default_value_t = false, global = true)]
    pub json_output: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Resume agents that were running and launch the configured ones.
    Run(RunArgs),
    /// Fill in missing secure settings interactively.
    Setup,
    /// Inspect or edit the stored agent records.
    Agents {
        #[command(subcommand)]
        action: AgentsCommand,
    },
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct RunArgs {
    /// Only launch members of these duty groups (repeatable). Default: every account.
    #[arg(long = "farm")]
    pub farms: Vec<String>,

    /// Skip agents recorded as running by a previous session.
    #[arg(long, default_value_t = false)]
    pub no_resume: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum AgentsCommand {
    List,
    Remove { username: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_auth")]
    pub auth: String,
}

/// The operator's launch file.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub farms: Vec<DutyGroup>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default)]
    pub login_check_hosts: Vec<String>,
    #[serde(default = "default_lobby")]
    pub lobby: Option<Vec3>,
    #[serde(default)]
    pub portal: Option<Vec3>,
    #[serde(default = "default_sidecar")]
    pub sidecar: String,
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
}

fn default_command_prefix() -> String {
    DEFAULT_COMMAND_PREFIX.to_string()
}

fn default_lobby() -> Option<Vec3> {
    Some(DEFAULT_LOBBY)
}

fn default_sidecar() -> String {
    DEFAULT_SIDECAR.to_string()
}

fn default_stagger_secs() -> u64 {
    5
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            accounts: Vec::new(),
            farms: Vec::new(),
            whitelist: Vec::new(),
            command_prefix: default_command_prefix(),
            login_check_hosts: Vec::new(),
            lobby: default_lobby(),
            portal: None,
            sidecar: default_sidecar(),
            stagger_secs: default_stagger_secs(),
        }
    }
}

/// Server endpoint after merging the launch file with secure settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub version: String,
}

impl LaunchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read launch file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse launch file {}", path.display()))
    }

    /// Launch-file values win; secure settings fill the gaps.
    pub fn endpoint(&self, settings: &SecureSettings) -> Result<ServerEndpoint> {
        let host = if self.server.host.trim().is_empty() {
            settings.get(SERVER_ADDRESS, "")
        } else {
            self.server.host.clone()
        };
        if host.trim().is_empty() {
            anyhow::bail!("no server address configured; run `agent-fleet setup`");
        }
        let port = match self.server.port {
            Some(port) => port,
            None => settings
                .get(SERVER_PORT, DEFAULT_PORT)
                .parse()
                .with_context(|| format!("invalid {SERVER_PORT} in secure settings"))?,
        };
        let version = self
            .server
            .version
            .clone()
            .unwrap_or_else(|| settings.get(GAME_VERSION, DEFAULT_VERSION));
        Ok(ServerEndpoint {
            host,
            port,
            version,
        })
    }

    /// Duty groups the run is restricted to: every group, or only those named.
    pub fn selected_farms(&self, farms: &[String]) -> Vec<DutyGroup> {
        if farms.is_empty() {
            return self.farms.clone();
        }
        self.farms
            .iter()
            .filter(|group| farms.contains(&group.name))
            .cloned()
            .collect()
    }

    /// Accounts to launch: every account, or only members of `farms`.
    pub fn selected_accounts(&self, farms: &[String]) -> Vec<Account> {
        if farms.is_empty() {
            return self.accounts.clone();
        }
        let groups = self.selected_farms(farms);
        self.accounts
            .iter()
            .filter(|account| {
                groups.iter().any(|group| {
                    group.has_member(&account.username)
                        || group.duties.contains_key(&account.username)
                })
            })
            .cloned()
            .collect()
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            command_prefix: self.command_prefix.clone(),
            login_check_hosts: self.login_check_hosts.clone(),
            lobby: self.lobby,
            portal: self.portal,
            stagger: Duration::from_secs(self.stagger_secs),
            ..FleetSettings::default()
        }
    }
}

/// Tunables shared by every agent in the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSettings {
    pub reconnect: ReconnectPolicy,
    pub dedup_window: Duration,
    pub dedup_cleanup_interval: Duration,
    pub notify_cooldown: Duration,
    pub monitor: MonitorSettings,
    pub command_prefix: String,
    /// Hosts where a silent login failure is probed for after spawning.
    pub login_check_hosts: Vec<String>,
    pub lobby: Option<Vec3>,
    pub portal: Option<Vec3>,
    pub stagger: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            dedup_window: DEFAULT_WINDOW,
            dedup_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            notify_cooldown: DEFAULT_COOLDOWN,
            monitor: MonitorSettings::default(),
            command_prefix: default_command_prefix(),
            login_check_hosts: Vec::new(),
            lobby: Some(DEFAULT_LOBBY),
            portal: None,
            stagger: Duration::from_secs(default_stagger_secs()),
        }
    }
}

impl FleetSettings {
    pub fn is_login_check_host(&self, host: &str) -> bool {
        self.login_check_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["agent-fleet", "run"]);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.state_file, PathBuf::from("cache.json"));
        assert_eq!(cli.settings_file, PathBuf::from("secure_config.json"));
        assert_eq!(cli.whitelist_dir, PathBuf::from("external_configs"));
        assert!(matches!(cli.command, Command::Run(RunArgs { no_resume: false, .. })));
    }

    #[test]
    fn cli_agents_remove() {
        let cli = Cli::parse_from(["agent-fleet", "--log-level", "debug", "agents", "remove", "miner1"]);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::Agents {
                action: AgentsCommand::Remove { username },
            } => assert_eq!(username, "miner1"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn launch_file_defaults() {
        let cfg: LaunchConfig = serde_json::from_str(
            r#"{"accounts": [{"username": "miner1"}], "farms": [
                {"name": "Gold Farm", "bots": ["miner1"], "duties": {"miner1": ["hitPiglin"]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(cfg.command_prefix, "fleet");
        assert_eq!(cfg.accounts[0].auth, "offline");
        assert_eq!(cfg.lobby, Some(DEFAULT_LOBBY));
        assert_eq!(cfg.stagger_secs, 5);
        assert!(cfg.farms[0].allow_teleport);
    }

    #[test]
    fn selects_accounts_by_farm() {
        let cfg: LaunchConfig = serde_json::from_str(
            r#"{"accounts": [{"username": "a"}, {"username": "b"}], "farms": [
                {"name": "Gold Farm", "bots": ["a"]}
            ]}"#,
        )
        .unwrap();
        let names: Vec<_> = cfg
            .selected_accounts(&["Gold Farm".to_string()])
            .into_iter()
            .map(|a| a.username)
            .collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(cfg.selected_accounts(&[]).len(), 2);
    }

    #[test]
    fn selected_farms_exclude_unnamed_groups() {
        let cfg: LaunchConfig = serde_json::from_str(
            r#"{"accounts": [{"username": "a"}, {"username": "b"}], "farms": [
                {"name": "Gold Farm", "bots": ["a"]},
                {"name": "Ghast Farm", "bots": ["b"], "allowTeleport": false}
            ]}"#,
        )
        .unwrap();
        let names: Vec<_> = cfg
            .selected_farms(&["Gold Farm".to_string()])
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["Gold Farm"]);
        assert_eq!(cfg.selected_farms(&[]).len(), 2);
        assert!(cfg.selected_farms(&["Nether Farm".to_string()]).is_empty());
    }

    #[test]
    fn endpoint_falls_back_to_secure_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SecureSettings::with_key(dir.path().join("s.json"), [7; 32]);
        settings.set(SERVER_ADDRESS, "play.example.net", false).unwrap();
        let endpoint = LaunchConfig::default().endpoint(&settings).unwrap();
        assert_eq!(
            endpoint,
            ServerEndpoint {
                host: "play.example.net".into(),
                port: 25565,
                version: "1.20.1".into(),
            }
        );
    }

    #[test]
    fn endpoint_requires_a_host() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SecureSettings::with_key(dir.path().join("s.json"), [7; 32]);
        assert!(LaunchConfig::default().endpoint(&settings).is_err());
    }
}
