//! Outbound alerts to a webhook endpoint, rate limited per message.
//!
//! Sends are fire-and-forget from the caller's point of view: a missing
//! endpoint, an active cooldown or an HTTP failure all end in a log line.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::secure_settings::{SecureSettings, NOTIFICATIONS_ENABLED, NOTIFICATION_ENDPOINT};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const COOLDOWN_KEY_CHARS: usize = 50;
const MAX_CONTENT_CHARS: usize = 2000;

pub const COLOR_DEFAULT: &str = "7289DA";
pub const COLOR_RED: &str = "FF0000";
pub const COLOR_ORANGE: &str = "FFA500";
pub const COLOR_GREEN: &str = "00FF00";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub content: String,
    pub title: Option<String>,
    /// Hex color without the leading `#`.
    pub color: String,
    pub fields: Vec<EmbedField>,
}

impl Notification {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: None,
            color: COLOR_DEFAULT.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>, color: &str) -> Self {
        self.title = Some(title.into());
        self.color = color.to_string();
        self
    }

    pub fn security(content: impl Into<String>) -> Self {
        Self::new(content).titled("Security Alert", COLOR_RED)
    }

    pub fn health_warning(agent: &str, health: f32) -> Self {
        Self::new(format!("Bot {agent} health is critically low: {health:.1}"))
            .titled("⚠️ Low Health Warning", COLOR_RED)
    }

    pub fn player_proximity(agent: &str, player: &str, distance: f64) -> Self {
        Self::new(format!(
            "Non-whitelisted player {player} is near bot {agent} ({distance:.1} blocks away)"
        ))
        .titled("👀 Non-whitelisted Player Detected", COLOR_ORANGE)
    }

    pub fn bot_status(agent: &str, status: &str) -> Self {
        Self::new(format!("Bot {agent}: {status}")).titled("Bot Status Update", COLOR_GREEN)
    }

    fn cooldown_key(&self) -> String {
        self.content.chars().take(COOLDOWN_KEY_CHARS).collect()
    }

    /// Webhook JSON body: `{content, embeds?: [{title, color, fields, timestamp}]}`.
    pub fn payload(&self) -> Value {
        let content = if self.content.chars().count() > MAX_CONTENT_CHARS {
            let mut cut: String = self.content.chars().take(MAX_CONTENT_CHARS - 3).collect();
            cut.push_str("...");
            cut
        } else {
            self.content.clone()
        };

        let mut payload = json!({ "content": content });
        if let Some(title) = &self.title {
            payload["embeds"] = json!([{
                "title": title,
                "color": u32::from_str_radix(&self.color, 16).unwrap_or(0),
                "fields": self.fields,
                "timestamp": Utc::now().to_rfc3339(),
            }]);
        }
        payload
    }
}

/// Destination for fleet alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification);

    async fn send_health_warning(&self, agent: &str, health: f32) {
        self.send(Notification::health_warning(agent, health)).await;
    }

    async fn send_player_proximity_alert(&self, agent: &str, player: &str, distance: f64) {
        self.send(Notification::player_proximity(agent, player, distance))
            .await;
    }

    async fn send_bot_status(&self, agent: &str, status: &str) {
        self.send(Notification::bot_status(agent, status)).await;
    }
}

/// Per-content cooldown: one send per key per window.
#[derive(Debug)]
struct CooldownGate {
    window: Duration,
    expiries: HashMap<String, Instant>,
}

impl CooldownGate {
    fn try_acquire(&mut self, key: String, now: Instant) -> bool {
        if self.expiries.get(&key).is_some_and(|expiry| *expiry > now) {
            return false;
        }
        self.expiries.insert(key, now + self.window);
        self.expiries.retain(|_, expiry| *expiry > now);
        true
    }
}

/// Posts notifications to a Discord-style webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    endpoint: Option<String>,
    client: reqwest::Client,
    gate: Mutex<CooldownGate>,
}

impl WebhookNotifier {
    pub fn new(endpoint: Option<String>) -> Self {
        Self::with_cooldown(endpoint, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(endpoint: Option<String>, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.filter(|url| !url.trim().is_empty()),
            client: http_client(REQUEST_TIMEOUT),
            gate: Mutex::new(CooldownGate {
                window: cooldown,
                expiries: HashMap::new(),
            }),
        }
    }

    /// Give up on a webhook request after `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Endpoint from the secure settings, unless notifications were turned off.
    pub fn from_settings(settings: &SecureSettings) -> Self {
        let endpoint = settings
            .get_bool(NOTIFICATIONS_ENABLED, true)
            .then(|| settings.get_opt(NOTIFICATION_ENDPOINT))
            .flatten();
        Self::new(endpoint)
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|error| {
            tracing::warn!(target = "agent_fleet::notify", error = %error, "falling back to default HTTP client");
            reqwest::Client::new()
        })
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send(&self, notification: Notification) {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!(target = "agent_fleet::notify", "webhook not configured, dropping notification");
            return;
        };

        let allowed = self
            .gate
            .lock()
            .try_acquire(notification.cooldown_key(), Instant::now());
        if !allowed {
            tracing::trace!(target = "agent_fleet::notify", "notification on cooldown");
            return;
        }

        let result = self
            .client
            .post(endpoint)
            .json(&notification.payload())
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(error) = result {
            tracing::warn!(target = "agent_fleet::notify", error = %error, "failed to send webhook notification");
        }
    }
}

/// Captures notifications instead of sending them.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub sent: Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn count_titled(&self, title: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.title.as_deref() == Some(title))
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
