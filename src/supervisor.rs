//! Reconnect bookkeeping for one agent.
//!
//! Decides whether a lost connection gets a new reconnect, replaces the one
//! already pending, or is folded into it. Retries are unlimited with a fixed
//! delay per cause.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay after the session ended.
    pub disconnect_delay: Duration,
    /// Delay after a network fault (refused, timed out, host not found).
    pub network_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            disconnect_delay: Duration::from_secs(10),
            network_delay: Duration::from_secs(30),
        }
    }
}

/// What triggered a reconnect. Later variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReconnectCause {
    Disconnected,
    NetworkFault,
}

impl ReconnectCause {
    /// Cause for a failed connection attempt.
    pub fn for_error(error: &TransportError) -> Self {
        if error.is_network_fault() {
            Self::NetworkFault
        } else {
            Self::Disconnected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::NetworkFault => "network_fault",
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, cause: ReconnectCause) -> Duration {
        match cause {
            ReconnectCause::Disconnected => self.disconnect_delay,
            ReconnectCause::NetworkFault => self.network_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReconnect {
    pub cause: ReconnectCause,
    pub delay: Duration,
    pub due: Instant,
}

/// Decision returned by [`Supervisor::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Start a timer for this reconnect; any earlier timer is void.
    Schedule(PendingReconnect),
    /// An equal or stronger reconnect is already pending.
    AlreadyPending(PendingReconnect),
    /// The agent is shutting down.
    Stopped,
}

#[derive(Debug)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    pending: Option<PendingReconnect>,
    stopping: bool,
    reconnects: u32,
}

impl Supervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            pending: None,
            stopping: false,
            reconnects: 0,
        }
    }

    pub fn request(&mut self, cause: ReconnectCause, now: Instant) -> ReconnectDecision {
        if self.stopping {
            return ReconnectDecision::Stopped;
        }
        if let Some(pending) = self.pending {
            if pending.cause >= cause {
                return ReconnectDecision::AlreadyPending(pending);
            }
        }
        let delay = self.policy.delay_for(cause);
        let pending = PendingReconnect {
            cause,
            delay,
            due: now + delay,
        };
        self.pending = Some(pending);
        ReconnectDecision::Schedule(pending)
    }

    /// The timer fired and a connection attempt is starting.
    pub fn on_attempt(&mut self) -> u32 {
        self.pending = None;
        self.reconnects += 1;
        self.reconnects
    }

    pub fn pending(&self) -> Option<PendingReconnect> {
        self.pending
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Stop accepting reconnects and forget the pending one.
    pub fn stop(&mut self) -> Option<PendingReconnect> {
        self.stopping = true;
        self.pending.take()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }
}
