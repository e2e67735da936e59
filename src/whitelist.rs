//! Trusted player names: the configured list plus an externally synced file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

/// Name of the newline-delimited file inside the synced directory.
pub const EXTERNAL_FILE: &str = "whitelist";
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    configured: HashSet<String>,
    external: HashSet<String>,
}

impl Whitelist {
    pub fn new(configured: impl IntoIterator<Item = String>) -> Self {
        Self {
            configured: configured.into_iter().collect(),
            external: HashSet::new(),
        }
    }

    pub fn with_external(mut self, external: impl IntoIterator<Item = String>) -> Self {
        self.external = external.into_iter().collect();
        self
    }

    pub fn contains(&self, username: &str) -> bool {
        self.configured.contains(username) || self.external.contains(username)
    }

    pub fn external_len(&self) -> usize {
        self.external.len()
    }

    /// Pull the latest whitelist into `dir` and read it. Any failure yields an
    /// empty list; startup never depends on the remote being reachable.
    pub async fn sync_external(dir: &Path) -> Vec<String> {
        match pull_and_read(dir).await {
            Ok(names) => {
                tracing::info!(
                    target = "agent_fleet::whitelist",
                    count = names.len(),
                    "external whitelist loaded"
                );
                names
            }
            Err(error) => {
                tracing::warn!(
                    target = "agent_fleet::whitelist",
                    dir = %dir.display(),
                    error = %error,
                    "external whitelist unavailable, using empty list"
                );
                Vec::new()
            }
        }
    }
}

async fn pull_and_read(dir: &Path) -> anyhow::Result<Vec<String>> {
    let output = tokio::time::timeout(
        SYNC_TIMEOUT,
        Command::new("git").arg("pull").current_dir(dir).output(),
    )
    .await??;
    if !output.status.success() {
        anyhow::bail!(
            "git pull failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let data = tokio::fs::read_to_string(dir.join(EXTERNAL_FILE)).await?;
    Ok(parse_names(&data))
}

/// One name per line; blank lines ignored.
pub fn parse_names(data: &str) -> Vec<String> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
