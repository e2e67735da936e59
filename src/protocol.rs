//! Wire format spoken with the game-client sidecar: newline-delimited JSON
//! envelopes over TCP, one sidecar connection per agent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FleetError, Result, TransportError};
use crate::transport::{
    ChatMessage, ConnectOptions, Control, Entity, EquipSlot, Goal, Item, Orientation, PlayerInfo,
    TransportEvent, Vec3,
};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope<T> {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FleetToSidecar {
    Hello {
        client_name: String,
        client_version: String,
    },
    Connect {
        options: ConnectOptions,
    },
    Chat {
        text: String,
    },
    Whisper {
        target: String,
        text: String,
    },
    SetControl {
        control: Control,
        active: bool,
    },
    Look {
        yaw: f64,
        pitch: f64,
    },
    SetGoal {
        goal: Goal,
    },
    Goto {
        goal: Goal,
    },
    Attack {
        entity_id: u64,
    },
    Equip {
        inventory_slot: u32,
        destination: EquipSlot,
    },
    ActivateItem {},
    Quit {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SidecarToFleet {
    HelloAck {
        sidecar_version: String,
        protocol_version: u32,
    },
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error(ProtocolError),
    State(WorldSnapshot),
    Event(SidecarEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError {
            code: err.code,
            message: err.message,
        }
    }
}

/// Everything the synchronous transport queries answer from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldSnapshot {
    #[serde(default)]
    pub position: Option<Vec3>,
    #[serde(default)]
    pub orientation: Option<Orientation>,
    #[serde(default)]
    pub health: Option<f32>,
    #[serde(default)]
    pub players: Vec<PlayerInfo>,
    #[serde(default)]
    pub inventory: Vec<Item>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// Lifecycle events as the sidecar reports them, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SidecarEvent {
    Login,
    Spawn,
    Chat {
        sender: String,
        text: String,
    },
    Whisper {
        sender: String,
        text: String,
    },
    Message {
        message: Value,
    },
    Health {
        value: f32,
    },
    End {
        #[serde(default)]
        reason: String,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

impl TryFrom<SidecarEvent> for TransportEvent {
    type Error = FleetError;

    fn try_from(event: SidecarEvent) -> Result<Self> {
        Ok(match event {
            SidecarEvent::Login => TransportEvent::Login,
            SidecarEvent::Spawn => TransportEvent::Spawn,
            SidecarEvent::Chat { sender, text } => TransportEvent::Chat { sender, text },
            SidecarEvent::Whisper { sender, text } => TransportEvent::Whisper { sender, text },
            SidecarEvent::Message { message } => {
                TransportEvent::Message(ChatMessage::from_json(&message)?)
            }
            SidecarEvent::Health { value } if value.is_finite() => TransportEvent::Health(value),
            SidecarEvent::Health { value } => {
                return Err(FleetError::Payload(format!("health must be finite, got {value}")))
            }
            SidecarEvent::End { reason } => TransportEvent::End { reason },
            SidecarEvent::Error { code, message } => {
                TransportEvent::Error(TransportError { code, message })
            }
        })
    }
}

/// One JSON line, without the trailing newline.
pub fn encode_frame(message: &FleetToSidecar, request_id: Option<&str>) -> Result<String> {
    let tagged = serde_json::to_value(message)?;
    let frame = ProtocolEnvelope {
        v: PROTOCOL_VERSION,
        msg_type: tagged["type"].as_str().unwrap_or_default().to_string(),
        request_id: request_id.map(ToOwned::to_owned),
        payload: tagged.get("payload").cloned().unwrap_or_else(|| json!({})),
    };
    Ok(serde_json::to_string(&frame)?)
}

pub fn decode_frame(line: &str) -> Result<(Option<String>, SidecarToFleet)> {
    let frame: ProtocolEnvelope<Value> = serde_json::from_str(line)?;
    if frame.v != PROTOCOL_VERSION {
        return Err(FleetError::Payload(format!(
            "unsupported protocol version {}",
            frame.v
        )));
    }
    let message = serde_json::from_value(json!({
        "type": frame.msg_type,
        "payload": frame.payload,
    }))?;
    Ok((frame.request_id, message))
}
