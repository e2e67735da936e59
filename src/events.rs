use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::dedup::MessageDedup;

pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Category of a per-agent log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    System,
    Chat,
    Whisper,
    Command,
    Error,
    Security,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Chat => "chat",
            Self::Whisper => "whisper",
            Self::Command => "command",
            Self::Error => "error",
            Self::Security => "security",
        }
    }
}

/// Per-agent log writer. Lines already emitted by another agent inside the
/// dedup window are dropped.
#[derive(Debug, Clone)]
pub struct AgentLog {
    agent: String,
    dedup: Arc<MessageDedup>,
}

impl AgentLog {
    pub fn new(agent: impl Into<String>, dedup: Arc<MessageDedup>) -> Self {
        Self {
            agent: agent.into(),
            dedup,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Returns false when the line was suppressed as a duplicate.
    pub fn log(&self, kind: LogKind, text: &str) -> bool {
        let raw = format!("[{}] {text}", self.agent);
        if self.dedup.is_duplicate(&raw, &self.agent) {
            return false;
        }
        let agent = self.agent.as_str();
        let kind_str = kind.as_str();
        match kind {
            LogKind::Security => {
                tracing::error!(target = "agent_fleet::agent", agent, kind = kind_str, "{text}")
            }
            LogKind::Error => {
                tracing::warn!(target = "agent_fleet::agent", agent, kind = kind_str, "{text}")
            }
            _ => tracing::info!(target = "agent_fleet::agent", agent, kind = kind_str, "{text}"),
        }
        true
    }
}

/// Machine-readable lifecycle events, one JSON object per line on stderr.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::new(false);
        emitter.emit("test", json!({"key": "value"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("connected", json!({"agent": "miner1"}));
        emitter.emit("reconnect_scheduled", 30);
    }

    #[test]
    fn second_agent_line_is_suppressed() {
        let dedup = Arc::new(MessageDedup::default());
        let a = AgentLog::new("miner1", dedup.clone());
        let b = AgentLog::new("miner2", dedup);
        assert!(a.log(LogKind::Chat, "Chat message from steve: hello all"));
        assert!(!b.log(LogKind::Chat, "Chat message from steve: hello all"));
        assert!(a.log(LogKind::Chat, "Chat message from steve: hello all"));
    }

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(serde_json::to_value(LogKind::Security).unwrap(), "security");
        assert_eq!(LogKind::Whisper.as_str(), "whisper");
    }
}
