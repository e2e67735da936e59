//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    AgentTransport, ConnectOptions, Control, Entity, EntityQuery, EquipSlot, Goal, Item,
    Orientation, PlayerInfo, TransportEvent, TransportFactory, TransportSession, Vec3,
};
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Chat(String),
    Whisper(String, String),
    Control(Control, bool),
    Look(f64, f64),
    SetGoal(Goal),
    Goto(Goal),
    Attack(u64),
    Equip(String, EquipSlot),
    Activate,
    Quit(String),
}

#[derive(Debug, Default)]
pub(crate) struct World {
    pub position: Option<Vec3>,
    pub orientation: Option<Orientation>,
    pub health: Option<f32>,
    pub players: Vec<PlayerInfo>,
    pub inventory: Vec<Item>,
    pub entities: Vec<Entity>,
    pub fail_set_goal: bool,
    pub fail_goto: bool,
    /// How long `goto` takes before it resolves.
    pub goto_delay: Option<Duration>,
    /// Positions handed out in order after `Control::Forward` is released.
    pub positions_after_forward: VecDeque<Vec3>,
}

pub(crate) struct FakeTransport {
    username: String,
    pub world: Mutex<World>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            world: Mutex::new(World::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn chats(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Chat(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn whispers(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Whisper(to, text) => Some((to.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn position(&self) -> Option<Vec3> {
        self.world.lock().position
    }

    fn orientation(&self) -> Option<Orientation> {
        self.world.lock().orientation
    }

    fn health(&self) -> Option<f32> {
        self.world.lock().health
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.world.lock().players.clone()
    }

    fn inventory(&self) -> Vec<Item> {
        self.world.lock().inventory.clone()
    }

    fn nearest_entity(&self, query: &EntityQuery) -> Option<Entity> {
        let world = self.world.lock();
        let origin = world.position;
        world
            .entities
            .iter()
            .filter(|e| query.matches(e, origin.as_ref()))
            .min_by(|a, b| {
                let da = origin.map(|o| o.distance_to(&a.position)).unwrap_or(0.0);
                let db = origin.map(|o| o.distance_to(&b.position)).unwrap_or(0.0);
                da.total_cmp(&db)
            })
            .cloned()
    }

    fn entities(&self, query: &EntityQuery) -> Vec<Entity> {
        let world = self.world.lock();
        let origin = world.position;
        world
            .entities
            .iter()
            .filter(|e| query.matches(e, origin.as_ref()))
            .cloned()
            .collect()
    }

    async fn chat(&self, text: &str) -> Result<(), TransportError> {
        self.record(Call::Chat(text.to_string()));
        Ok(())
    }

    async fn whisper(&self, target: &str, text: &str) -> Result<(), TransportError> {
        self.record(Call::Whisper(target.to_string(), text.to_string()));
        Ok(())
    }

    async fn set_control_state(
        &self,
        control: Control,
        active: bool,
    ) -> Result<(), TransportError> {
        self.record(Call::Control(control, active));
        if control == Control::Forward && !active {
            let mut world = self.world.lock();
            if let Some(next) = world.positions_after_forward.pop_front() {
                world.position = Some(next);
            }
        }
        Ok(())
    }

    async fn look(&self, yaw: f64, pitch: f64) -> Result<(), TransportError> {
        self.record(Call::Look(yaw, pitch));
        self.world.lock().orientation = Some(Orientation { yaw, pitch });
        Ok(())
    }

    async fn set_goal(&self, goal: Goal) -> Result<(), TransportError> {
        if self.world.lock().fail_set_goal {
            return Err(TransportError::new("pathfinder unavailable"));
        }
        self.record(Call::SetGoal(goal));
        Ok(())
    }

    async fn goto(&self, goal: Goal) -> Result<(), TransportError> {
        self.record(Call::Goto(goal));
        let delay = self.world.lock().goto_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.world.lock().fail_goto {
            return Err(TransportError::new("no path"));
        }
        Ok(())
    }

    async fn attack(&self, entity: &Entity) -> Result<(), TransportError> {
        self.record(Call::Attack(entity.id));
        Ok(())
    }

    async fn equip(&self, item: &Item, slot: EquipSlot) -> Result<(), TransportError> {
        self.record(Call::Equip(item.name.clone(), slot));
        Ok(())
    }

    async fn activate_item(&self) -> Result<(), TransportError> {
        self.record(Call::Activate);
        Ok(())
    }

    async fn quit(&self, reason: &str) -> Result<(), TransportError> {
        self.record(Call::Quit(reason.to_string()));
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps the event senders for the test to drive.
#[derive(Default)]
pub(crate) struct FakeFactory {
    pub sessions: Mutex<Vec<(Arc<FakeTransport>, mpsc::Sender<TransportEvent>)>>,
    pub connects: Mutex<Vec<ConnectOptions>>,
    pub failures: Mutex<VecDeque<TransportError>>,
    pub world: Mutex<Option<World>>,
    /// Applied to every connect after it is recorded.
    pub connect_delay: Mutex<Option<Duration>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.sessions.lock().iter().map(|(t, _)| Arc::clone(t)).collect()
    }

    pub fn last(&self) -> (Arc<FakeTransport>, mpsc::Sender<TransportEvent>) {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no session opened")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError> {
        self.connects.lock().push(options.clone());
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let transport = Arc::new(FakeTransport::new(&options.username));
        if let Some(world) = self.world.lock().take() {
            *transport.world.lock() = world;
        }
        let (tx, rx) = mpsc::channel(64);
        self.sessions.lock().push((transport.clone(), tx));
        Ok(TransportSession {
            transport,
            events: rx,
        })
    }
}
