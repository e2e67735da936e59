//! [`AgentTransport`] backed by an external game-client sidecar.
//!
//! Each agent opens its own TCP connection to the sidecar. Actions go out as
//! request frames; `connect` and `goto` wait for the correlated reply, the
//! rest are fire-and-forget. The sidecar pushes world snapshots, which answer
//! the synchronous queries, and lifecycle events, which are validated into
//! [`TransportEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{decode_frame, encode_frame, FleetToSidecar, SidecarToFleet, WorldSnapshot};
use crate::transport::{
    AgentTransport, ConnectOptions, Control, Entity, EntityQuery, EquipSlot, Goal, Item,
    Orientation, PlayerInfo, TransportEvent, TransportFactory, TransportSession, Vec3,
};

const EVENT_BUFFER: usize = 256;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GOTO_TIMEOUT: Duration = Duration::from_secs(120);

type Reply = Result<Value, TransportError>;

#[derive(Default)]
struct Shared {
    snapshot: Mutex<WorldSnapshot>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(TransportError::new(reason)));
        }
    }
}

pub struct SidecarTransport {
    username: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    goto_timeout: Duration,
}

impl SidecarTransport {
    async fn send(&self, message: FleetToSidecar, request_id: Option<&str>) -> Result<(), TransportError> {
        let mut line = encode_frame(&message, request_id)
            .map_err(|e| TransportError::new(format!("encode failed: {e}")))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn request(&self, message: FleetToSidecar, timeout: Duration) -> Reply {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);

        if let Err(error) = self.send(message, Some(&request_id)).await {
            self.shared.pending.lock().remove(&request_id);
            return Err(error);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::new("sidecar dropped the request")),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(TransportError::with_code("ETIMEDOUT", "sidecar request timed out"))
            }
        }
    }
}

#[async_trait]
impl AgentTransport for SidecarTransport {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn position(&self) -> Option<Vec3> {
        self.shared.snapshot.lock().position
    }

    fn orientation(&self) -> Option<Orientation> {
        self.shared.snapshot.lock().orientation
    }

    fn health(&self) -> Option<f32> {
        self.shared.snapshot.lock().health
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.shared.snapshot.lock().players.clone()
    }

    fn inventory(&self) -> Vec<Item> {
        self.shared.snapshot.lock().inventory.clone()
    }

    fn nearest_entity(&self, query: &EntityQuery) -> Option<Entity> {
        let snapshot = self.shared.snapshot.lock();
        let origin = snapshot.position?;
        snapshot
            .entities
            .iter()
            .filter(|e| query.matches(e, Some(&origin)))
            .min_by(|a, b| {
                origin
                    .distance_to(&a.position)
                    .total_cmp(&origin.distance_to(&b.position))
            })
            .cloned()
    }

    fn entities(&self, query: &EntityQuery) -> Vec<Entity> {
        let snapshot = self.shared.snapshot.lock();
        let origin = snapshot.position;
        snapshot
            .entities
            .iter()
            .filter(|e| query.matches(e, origin.as_ref()))
            .cloned()
            .collect()
    }

    async fn chat(&self, text: &str) -> Result<(), TransportError> {
        self.send(FleetToSidecar::Chat { text: text.to_string() }, None)
            .await
    }

    async fn whisper(&self, target: &str, text: &str) -> Result<(), TransportError> {
        self.send(
            FleetToSidecar::Whisper {
                target: target.to_string(),
                text: text.to_string(),
            },
            None,
        )
        .await
    }

    async fn set_control_state(&self, control: Control, active: bool) -> Result<(), TransportError> {
        self.send(FleetToSidecar::SetControl { control, active }, None)
            .await
    }

    async fn look(&self, yaw: f64, pitch: f64) -> Result<(), TransportError> {
        self.send(FleetToSidecar::Look { yaw, pitch }, None).await
    }

    async fn set_goal(&self, goal: Goal) -> Result<(), TransportError> {
        self.send(FleetToSidecar::SetGoal { goal }, None).await
    }

    async fn goto(&self, goal: Goal) -> Result<(), TransportError> {
        self.request(FleetToSidecar::Goto { goal }, self.goto_timeout)
            .await
            .map(|_| ())
    }

    async fn attack(&self, entity: &Entity) -> Result<(), TransportError> {
        self.send(FleetToSidecar::Attack { entity_id: entity.id }, None)
            .await
    }

    async fn equip(&self, item: &Item, slot: EquipSlot) -> Result<(), TransportError> {
        self.send(
            FleetToSidecar::Equip {
                inventory_slot: item.slot,
                destination: slot,
            },
            None,
        )
        .await
    }

    async fn activate_item(&self) -> Result<(), TransportError> {
        self.send(FleetToSidecar::ActivateItem {}, None).await
    }

    async fn quit(&self, reason: &str) -> Result<(), TransportError> {
        self.send(
            FleetToSidecar::Quit {
                reason: reason.to_string(),
            },
            None,
        )
        .await
    }
}

/// Opens one sidecar connection per agent session.
#[derive(Debug, Clone)]
pub struct SidecarFactory {
    address: String,
    connect_timeout: Duration,
    goto_timeout: Duration,
}

impl SidecarFactory {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            goto_timeout: DEFAULT_GOTO_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, goto: Duration) -> Self {
        self.connect_timeout = connect;
        self.goto_timeout = goto;
        self
    }
}

#[async_trait]
impl TransportFactory for SidecarFactory {
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::with_code("ETIMEDOUT", "sidecar connect timed out"))??;
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared::default());
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&shared),
            event_tx,
            options.username.clone(),
        ));

        let transport = Arc::new(SidecarTransport {
            username: options.username.clone(),
            writer: tokio::sync::Mutex::new(writer),
            shared,
            goto_timeout: self.goto_timeout,
        });
        transport
            .send(
                FleetToSidecar::Hello {
                    client_name: env!("CARGO_PKG_NAME").to_string(),
                    client_version: env!("CARGO_PKG_VERSION").to_string(),
                },
                None,
            )
            .await?;
        transport
            .request(
                FleetToSidecar::Connect {
                    options: options.clone(),
                },
                self.connect_timeout,
            )
            .await?;

        tracing::info!(
            target = "agent_fleet::bridge",
            agent = %options.username,
            sidecar = %self.address,
            "sidecar session opened"
        );
        Ok(TransportSession {
            transport,
            events: event_rx,
        })
    }
}

async fn read_loop(
    reader: OwnedReadHalf,
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
    agent: String,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut ended = false;
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "sidecar closed the connection".to_string(),
            Err(error) => break format!("sidecar read failed: {error}"),
        };
        if line.trim().is_empty() {
            continue;
        }
        let (request_id, message) = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(target = "agent_fleet::bridge", agent = %agent, error = %error, "dropping invalid frame");
                continue;
            }
        };
        match message {
            SidecarToFleet::HelloAck {
                sidecar_version,
                protocol_version,
            } => {
                tracing::debug!(target = "agent_fleet::bridge", agent = %agent, sidecar_version = %sidecar_version, protocol_version, "sidecar hello");
            }
            SidecarToFleet::Ok { result } => resolve(&shared, request_id, Ok(result)),
            SidecarToFleet::Error(error) => resolve(&shared, request_id, Err(error.into())),
            SidecarToFleet::State(snapshot) => *shared.snapshot.lock() = snapshot,
            SidecarToFleet::Event(event) => match TransportEvent::try_from(event) {
                Ok(event) => {
                    ended |= matches!(event, TransportEvent::End { .. });
                    if events.send(event).await.is_err() {
                        break "session closed".to_string();
                    }
                }
                Err(error) => {
                    tracing::warn!(target = "agent_fleet::bridge", agent = %agent, error = %error, "dropping invalid event")
                }
            },
        }
    };

    shared.fail_pending(&reason);
    if !ended {
        let _ = events.send(TransportEvent::End { reason }).await;
    }
}

fn resolve(shared: &Shared, request_id: Option<String>, reply: Reply) {
    let waiter = request_id.and_then(|id| shared.pending.lock().remove(&id));
    match (waiter, reply) {
        (Some(tx), reply) => {
            let _ = tx.send(reply);
        }
        (None, Err(error)) => {
            tracing::warn!(target = "agent_fleet::bridge", error = %error, "sidecar reported an error");
        }
        (None, Ok(_)) => {}
    }
}
