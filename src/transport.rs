//! Capability interface to the external game-client library.
//!
//! The fleet never talks to the game protocol directly. A transport exposes
//! a small set of actions and queries, and streams lifecycle events that have
//! already been validated into [`TransportEvent`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{FleetError, TransportError};

#[cfg(test)]
pub(crate) mod fake;

/// A position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Head orientation in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
}

/// Movement controls that can be held down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Forward,
    Back,
    Left,
    Right,
    Jump,
    Sprint,
    Sneak,
}

/// Navigation goals understood by the movement subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Goal {
    /// Stand exactly on a block.
    Block { x: i64, y: i64, z: i64 },
    /// Stay within `range` of a point.
    Near { x: f64, y: f64, z: f64, range: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipSlot {
    Hand,
    OffHand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    pub name: String,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub username: String,
    /// Absent while the player is outside render distance.
    #[serde(default)]
    pub position: Option<Vec3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub slot: u32,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Serialized component/NBT data attached to the item, if any.
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_count() -> u32 {
    1
}

/// Filter for entity lookups: any of `names`, optionally within `max_distance`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityQuery {
    pub names: Vec<String>,
    pub max_distance: Option<f64>,
}

impl EntityQuery {
    pub fn named(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
            max_distance: None,
        }
    }

    pub fn any_of(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            max_distance: None,
        }
    }

    pub fn within(mut self, distance: f64) -> Self {
        self.max_distance = Some(distance);
        self
    }

    pub fn matches(&self, entity: &Entity, origin: Option<&Vec3>) -> bool {
        if !self.names.iter().any(|n| n == &entity.name) {
            return false;
        }
        match (self.max_distance, origin) {
            (Some(max), Some(origin)) => origin.distance_to(&entity.position) <= max,
            _ => true,
        }
    }
}

/// Options handed to a [`TransportFactory`] when opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub username: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Lifecycle events emitted by a transport session, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Login,
    Spawn,
    Chat { sender: String, text: String },
    Whisper { sender: String, text: String },
    Message(ChatMessage),
    Health(f32),
    End { reason: String },
    Error(TransportError),
}

/// Structured chat payload with optional hover-text components.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub extra: Vec<ChatComponent>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatComponent {
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "hoverEvent")]
    pub hover_event: Option<HoverEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoverEvent {
    pub action: String,
    #[serde(default)]
    pub contents: Option<HoverContents>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoverContents {
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: Vec::new(),
        }
    }

    /// Validate a loosely shaped chat payload at the transport boundary.
    pub fn from_json(value: &Value) -> Result<Self, FleetError> {
        match value {
            Value::String(text) => Ok(Self::plain(text.clone())),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| FleetError::Payload(format!("chat message: {e}"))),
            other => Err(FleetError::Payload(format!(
                "chat message must be a string or object, got {other}"
            ))),
        }
    }

    /// Flattened text of the message and all of its components.
    pub fn to_plain_text(&self) -> String {
        let mut out = self.text.clone();
        for part in &self.extra {
            out.push_str(&part.text);
        }
        out
    }

    /// Show-text hover strings attached to components.
    pub fn hover_texts(&self) -> impl Iterator<Item = &str> {
        self.extra.iter().filter_map(|part| {
            let hover = part.hover_event.as_ref()?;
            if hover.action != "show_text" {
                return None;
            }
            hover.contents.as_ref()?.text.as_deref()
        })
    }

    /// Servers mark private messages with a "From"/"To" hover tooltip.
    pub fn is_private(&self) -> bool {
        self.hover_texts()
            .any(|text| text.contains("From") || text.contains("To"))
    }
}

/// Actions and queries exposed by a connected game client.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Username the server knows this client by.
    fn username(&self) -> String;
    fn position(&self) -> Option<Vec3>;
    fn orientation(&self) -> Option<Orientation>;
    fn health(&self) -> Option<f32>;
    fn players(&self) -> Vec<PlayerInfo>;
    fn inventory(&self) -> Vec<Item>;
    fn nearest_entity(&self, query: &EntityQuery) -> Option<Entity>;
    fn entities(&self, query: &EntityQuery) -> Vec<Entity>;

    async fn chat(&self, text: &str) -> Result<(), TransportError>;
    async fn whisper(&self, target: &str, text: &str) -> Result<(), TransportError>;
    async fn set_control_state(&self, control: Control, active: bool)
        -> Result<(), TransportError>;
    async fn look(&self, yaw: f64, pitch: f64) -> Result<(), TransportError>;
    async fn set_goal(&self, goal: Goal) -> Result<(), TransportError>;
    /// Path to `goal` and resolve once it is reached or pathing gives up.
    async fn goto(&self, goal: Goal) -> Result<(), TransportError>;
    async fn attack(&self, entity: &Entity) -> Result<(), TransportError>;
    async fn equip(&self, item: &Item, slot: EquipSlot) -> Result<(), TransportError>;
    async fn activate_item(&self) -> Result<(), TransportError>;
    async fn quit(&self, reason: &str) -> Result<(), TransportError>;
}

/// A freshly opened session: the action handle plus its event stream.
pub struct TransportSession {
    pub transport: Arc<dyn AgentTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transport sessions. One call per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError>;
}
