//! Error types shared across the fleet services.

use thiserror::Error;

/// Error codes the transport reports for faults that a delayed reconnect can fix.
const NETWORK_FAULT_CODES: &[&str] = &["ECONNREFUSED", "ETIMEDOUT", "ENOTFOUND"];

/// Errors raised by the fleet services.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Reading or writing a state file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file or wire payload was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encrypting or decrypting a secure setting failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A configuration value was missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A transport payload did not have the expected shape.
    #[error("invalid transport payload: {0}")]
    Payload(String),

    /// The agent transport reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

/// A failure reported by the agent transport, optionally carrying a socket-level code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", display(.code, .message))]
pub struct TransportError {
    pub code: Option<String>,
    pub message: String,
}

fn display(code: &Option<String>, message: &str) -> String {
    match code {
        Some(code) => format!("{code}: {message}"),
        None => message.to_string(),
    }
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Transient network faults (refused, timed out, unknown host).
    pub fn is_network_fault(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| NETWORK_FAULT_CODES.contains(&code))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::NotFound => Some("ENOTFOUND"),
            _ => None,
        };
        Self {
            code: code.map(str::to_string),
            message: err.to_string(),
        }
    }
}
