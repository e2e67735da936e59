//! Fleet-wide suppression of chat/system lines that several agents observe.
//!
//! Every agent on the same server sees the same public chat. The first agent to
//! report a line wins; any other agent reporting the same normalized content
//! within the window is told it is a duplicate. An agent repeating a line it
//! already reported is never suppressed by its own record.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

const CHAT_PREFIX: &str = "Chat message from ";
const SYSTEM_PREFIX: &str = "System Message: ";

#[derive(Debug, Clone)]
struct SeenRecord {
    last_seen: Instant,
    agents: Vec<String>,
}

#[derive(Debug)]
struct DedupWindow {
    window: Duration,
    seen: HashMap<String, SeenRecord>,
}

impl DedupWindow {
    fn check(&mut self, key: String, agent: &str, now: Instant) -> bool {
        let Some(record) = self.seen.get_mut(&key) else {
            self.seen.insert(
                key,
                SeenRecord {
                    last_seen: now,
                    agents: vec![agent.to_string()],
                },
            );
            return false;
        };

        if record.agents.iter().any(|a| a == agent) {
            return false;
        }

        if now.saturating_duration_since(record.last_seen) < self.window {
            record.agents.push(agent.to_string());
            return true;
        }

        record.last_seen = record.last_seen.max(now);
        record.agents = vec![agent.to_string()];
        false
    }

    fn evict(&mut self, now: Instant) -> usize {
        let max_age = self.window * 2;
        let before = self.seen.len();
        self.seen
            .retain(|_, record| now.saturating_duration_since(record.last_seen) <= max_age);
        before - self.seen.len()
    }
}

/// Shared dedup service; one instance per fleet.
#[derive(Debug)]
pub struct MessageDedup {
    inner: Mutex<DedupWindow>,
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl MessageDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(DedupWindow {
                window,
                seen: HashMap::new(),
            }),
        }
    }

    /// Strip agent and message-kind prefixes so that the same event reported
    /// by different agents normalizes to the same content.
    pub fn extract_content(raw: &str) -> String {
        let mut content = raw;
        if let Some((_, rest)) = content.split_once("] ") {
            content = rest;
        }

        if content.starts_with(CHAT_PREFIX) {
            if let Some((_, body)) = content.split_once(": ") {
                content = body;
            }
        }

        if let Some(body) = content.strip_prefix(SYSTEM_PREFIX) {
            content = body;
        }

        content.trim().to_string()
    }

    pub fn is_duplicate(&self, raw: &str, agent: &str) -> bool {
        self.is_duplicate_at(raw, agent, Instant::now())
    }

    pub fn is_duplicate_at(&self, raw: &str, agent: &str, now: Instant) -> bool {
        let content = Self::extract_content(raw);
        if is_trivial(&content) {
            return false;
        }
        self.inner.lock().check(content.to_lowercase(), agent, now)
    }

    /// Drop records not updated for twice the window. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        self.inner.lock().evict(now)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().seen.is_empty()
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = dedup.cleanup();
                        if dropped > 0 {
                            tracing::trace!(target = "agent_fleet::dedup", dropped, "expired dedup records");
                        }
                    }
                }
            }
        })
    }
}

fn is_trivial(content: &str) -> bool {
    content.chars().count() < 3 || content.chars().all(|c| c.is_ascii_digit())
}
