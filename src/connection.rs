//! Per-agent lifecycle: connect, react to transport events, authorize remote
//! commands and reconnect after failures.
//!
//! A [`ConnectionManager`] is a cheap handle; clones share the same agent.
//! Each successful connect starts a session task that consumes the
//! transport's event stream in order. Everything the session starts (duties,
//! monitors, the spawn routine) hangs off the session's cancellation token.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::commands::{self, base_username, CommandOutcome, GuardContext, Invocation, Refusal};
use crate::config::FleetSettings;
use crate::dedup::MessageDedup;
use crate::duties::DutyScheduler;
use crate::error::TransportError;
use crate::events::{AgentLog, EventEmitter, LogKind};
use crate::monitor::{spawn_proximity_monitor, HealthMonitor};
use crate::notify::{Notification, NotificationSink};
use crate::registry::{AgentMeta, AgentMetaPatch, AgentRegistry};
use crate::state::{AgentRecord, AgentRecordPatch, AgentState, StateStore};
use crate::supervisor::{PendingReconnect, ReconnectCause, ReconnectDecision, Supervisor};
use crate::transport::{
    AgentTransport, ChatMessage, ConnectOptions, Control, Goal, TransportEvent, TransportFactory,
    Vec3,
};
use crate::whitelist::Whitelist;

const PROBE_HOLD: Duration = Duration::from_secs(2);
const PROBE_SETTLE: Duration = Duration::from_secs(3);
const PROBE_MIN_DISPLACEMENT: f64 = 0.5;
pub const UNREACHABLE: &str = "I couldn't reach the destination.";

/// Shared services every agent of a fleet talks to.
#[derive(Clone)]
pub struct FleetServices {
    pub registry: Arc<AgentRegistry>,
    pub dedup: Arc<MessageDedup>,
    pub state: Arc<StateStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub factory: Arc<dyn TransportFactory>,
    pub scheduler: Arc<DutyScheduler>,
    pub whitelist: Arc<Whitelist>,
    pub settings: Arc<FleetSettings>,
    pub events: EventEmitter,
    pub command_password: Option<String>,
    /// Fires on fleet shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

/// How to reach the server as one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub username: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub auth: String,
    /// Server-side `/login` password, if the server wants one.
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    LoggedIn,
    Spawned,
    Reconnecting,
}

struct Session {
    id: u64,
    host: String,
    transport: Arc<dyn AgentTransport>,
    cancel: CancellationToken,
}

struct Inner {
    profile: AgentProfile,
    services: FleetServices,
    log: AgentLog,
    phase: Mutex<Phase>,
    session: Mutex<Option<Session>>,
    supervisor: Mutex<Supervisor>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    next_session: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(profile: AgentProfile, services: FleetServices) -> Self {
        let log = AgentLog::new(profile.username.clone(), services.dedup.clone());
        let supervisor = Supervisor::new(services.settings.reconnect);
        Self {
            inner: Arc::new(Inner {
                profile,
                services,
                log,
                phase: Mutex::new(Phase::Disconnected),
                session: Mutex::new(None),
                supervisor: Mutex::new(supervisor),
                reconnect_task: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.profile.username
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn pending_reconnect(&self) -> Option<PendingReconnect> {
        self.inner.supervisor.lock().pending()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.inner.supervisor.lock().reconnect_count()
    }

    fn services(&self) -> &FleetServices {
        &self.inner.services
    }

    fn log(&self, kind: LogKind, text: &str) -> bool {
        self.inner.log.log(kind, text)
    }

    fn set_phase(&self, phase: Phase) {
        *self.inner.phase.lock() = phase;
    }

    /// Hand a notification to the sink on its own task.
    fn notify(&self, notification: Notification) {
        let notifier = Arc::clone(&self.services().notifier);
        tokio::spawn(async move { notifier.send(notification).await });
    }

    /// Connection options, preferring the server and auth method the agent
    /// last worked on.
    fn connect_options(&self) -> ConnectOptions {
        let profile = &self.inner.profile;
        let mut options = ConnectOptions {
            username: profile.username.clone(),
            host: profile.host.clone(),
            port: profile.port,
            version: profile.version.clone(),
            auth: profile.auth.clone(),
            password: profile.password.clone(),
        };
        if let Some(record) = self.services().state.get_bot(&profile.username) {
            if !record.server_address.is_empty() {
                options.host = record.server_address;
            }
            options.auth = record.auth_method;
        }
        options
    }

    /// Open the transport and start consuming its events. Returns once the
    /// session task is running; failures schedule a reconnect.
    pub async fn connect(&self) {
        if self.inner.supervisor.lock().is_stopping() {
            return;
        }
        if self.is_connected() {
            tracing::debug!(target = "agent_fleet::connection", agent = %self.username(), "already connected");
            return;
        }
        self.set_phase(Phase::Connecting);
        let options = self.connect_options();
        self.log(
            LogKind::System,
            &format!("Connecting to {}:{}", options.host, options.port),
        );

        let connecting = self.services().factory.connect(&options);
        let result = tokio::select! {
            _ = self.services().shutdown.cancelled() => {
                self.set_phase(Phase::Disconnected);
                return;
            }
            result = connecting => result,
        };
        let opened = match result {
            Ok(opened) => opened,
            Err(error) => {
                self.set_phase(Phase::Disconnected);
                self.log(LogKind::Error, &format!("Connection failed: {error}"));
                self.schedule_reconnect(ReconnectCause::for_error(&error));
                return;
            }
        };

        let username = self.username().to_string();
        let has_duty_group = self.services().scheduler.group_for(&username).is_some();
        let cancel = self.services().shutdown.child_token();
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        // Shutdown or a concurrent connect may have won while the transport was opening.
        let registered = {
            let mut slot = self.inner.session.lock();
            if slot.is_some() || self.inner.supervisor.lock().is_stopping() {
                None
            } else {
                *slot = Some(Session {
                    id,
                    host: options.host.clone(),
                    transport: Arc::clone(&opened.transport),
                    cancel: cancel.clone(),
                });
                Some(self.services().registry.register_bot(
                    &username,
                    AgentMeta {
                        host: options.host.clone(),
                        has_duty_group,
                    },
                ))
            }
        };
        let Some(is_primary) = registered else {
            tracing::debug!(target = "agent_fleet::connection", agent = %username, "closing surplus connection");
            if self.inner.supervisor.lock().is_stopping() {
                self.set_phase(Phase::Disconnected);
            }
            if let Err(error) = opened.transport.quit("connection not needed").await {
                tracing::debug!(target = "agent_fleet::connection", agent = %username, error = %error, "quit failed");
            }
            return;
        };
        if is_primary {
            self.log(LogKind::System, "Registered as primary agent");
        }

        self.notify(Notification::bot_status(&username, "Connected to server"));
        self.services().events.emit(
            "connected",
            json!({ "agent": username, "host": options.host, "primary": is_primary }),
        );

        let this = self.clone();
        tokio::spawn(this.run_session(id, opened.transport, opened.events, cancel));
    }

    /// Ask the transport to close. The resulting `end` event drives the
    /// usual cleanup and reconnect.
    pub async fn disconnect(&self) {
        let transport = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.transport));
        let Some(transport) = transport else {
            return;
        };
        if let Err(error) = transport.quit("disconnect requested").await {
            self.log(LogKind::Error, &format!("Failed to close connection: {error}"));
        }
    }

    /// Stop for good: cancel any pending reconnect, end the session and leave
    /// the stored record untouched so the agent is resumed next launch.
    pub async fn shutdown(&self) {
        self.inner.supervisor.lock().stop();
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(error) = session.transport.quit("fleet shutting down").await {
                tracing::debug!(target = "agent_fleet::connection", agent = %self.username(), error = %error, "quit failed");
            }
            self.services().registry.remove_bot(self.username());
        }
        self.set_phase(Phase::Disconnected);
    }

    async fn run_session(
        self,
        id: u64,
        transport: Arc<dyn AgentTransport>,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let monitor = &self.services().settings.monitor;
        let mut health = HealthMonitor::new(monitor.health_threshold, monitor.health_cooldown);
        let mut spawned = false;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                self.on_end(id, "transport closed the event stream").await;
                break;
            };
            match event {
                TransportEvent::Login => self.on_login(&transport).await,
                TransportEvent::Spawn => {
                    self.set_phase(Phase::Spawned);
                    if spawned {
                        self.log(LogKind::System, "Respawned");
                        let this = self.clone();
                        let transport = Arc::clone(&transport);
                        spawn_in_session(&cancel, async move {
                            this.navigate_from_lobby(transport.as_ref()).await;
                        });
                    } else {
                        spawned = true;
                        spawn_in_session(
                            &cancel,
                            self.clone().on_first_spawn(Arc::clone(&transport), cancel.clone()),
                        );
                    }
                }
                TransportEvent::Chat { sender, text } => self.on_chat(&sender, &text),
                TransportEvent::Whisper { sender, text } => self.on_whisper(&sender, &text).await,
                TransportEvent::Message(message) => self.on_message(&message),
                TransportEvent::Health(value) => {
                    if health.observe(value, Instant::now()) {
                        self.log(LogKind::Error, &format!("Health critically low: {value:.1}"));
                        self.notify(Notification::health_warning(self.username(), value));
                    }
                }
                TransportEvent::Error(error) => self.on_error(error),
                TransportEvent::End { reason } => {
                    self.on_end(id, &reason).await;
                    break;
                }
            }
        }
    }

    async fn send_login(&self, transport: &dyn AgentTransport) {
        let Some(password) = self.inner.profile.password.as_deref() else {
            return;
        };
        if let Err(error) = transport.chat(&format!("/login {password}")).await {
            self.log(LogKind::Error, &format!("Failed to send login: {error}"));
        }
    }

    async fn on_login(&self, transport: &Arc<dyn AgentTransport>) {
        self.set_phase(Phase::LoggedIn);
        self.log(LogKind::System, "Logged in");
        self.send_login(transport.as_ref()).await;

        let host = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.host.clone())
            .unwrap_or_else(|| self.inner.profile.host.clone());
        let state = &self.services().state;
        let previous = state.get_bot(self.username());
        let record = AgentRecord {
            username: self.username().to_string(),
            server_address: host,
            auth_method: previous
                .as_ref()
                .map(|r| r.auth_method.clone())
                .unwrap_or_else(|| self.inner.profile.auth.clone()),
            state: AgentState::Running,
            farm: previous.and_then(|r| r.farm),
            updated_at: None,
        };
        if let Err(error) = state.upsert_bot(record) {
            self.log(LogKind::Error, &format!("Failed to record agent: {error}"));
        }
    }

    async fn on_first_spawn(self, transport: Arc<dyn AgentTransport>, cancel: CancellationToken) {
        self.log(LogKind::System, "Spawned");
        if let Some(position) = transport.position() {
            self.log(LogKind::System, &format!("Position: {position}"));
        }
        self.notify(Notification::bot_status(self.username(), "Spawned in world"));
        let host = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.host.clone())
            .unwrap_or_default();
        if self.services().settings.is_login_check_host(&host) {
            self.probe_login(transport.as_ref()).await;
        }

        let services = self.services();
        let duties = services.scheduler.assign_duties(Arc::clone(&transport), &cancel);
        services.registry.update_bot(
            self.username(),
            AgentMetaPatch {
                has_duty_group: Some(!duties.is_empty()),
                ..Default::default()
            },
        );
        spawn_proximity_monitor(
            Arc::clone(&transport),
            Arc::clone(&services.whitelist),
            Arc::clone(&services.notifier),
            self.inner.log.clone(),
            services.settings.monitor,
            cancel.child_token(),
        );

        self.navigate_from_lobby(transport.as_ref()).await;
    }

    /// Walk forward briefly; an agent that cannot move is stuck at the login
    /// prompt and gets the login resent.
    async fn probe_login(&self, transport: &dyn AgentTransport) {
        let start = transport.position();
        let nudge = async {
            transport.set_control_state(Control::Forward, true).await?;
            tokio::time::sleep(PROBE_HOLD).await;
            transport.set_control_state(Control::Forward, false).await
        };
        if let Err(error) = nudge.await {
            self.log(LogKind::Error, &format!("Login check failed: {error}"));
            return;
        }
        tokio::time::sleep(PROBE_SETTLE).await;

        let moved = match (start, transport.position()) {
            (Some(a), Some(b)) => a.distance_to(&b),
            _ => 0.0,
        };
        if moved < PROBE_MIN_DISPLACEMENT {
            self.log(LogKind::System, "Agent did not move, resending login");
            self.send_login(transport).await;
        } else {
            self.log(LogKind::System, "Login confirmed");
        }
    }

    async fn navigate_from_lobby(&self, transport: &dyn AgentTransport) {
        let settings = &self.services().settings;
        let (Some(lobby), Some(portal)) = (settings.lobby, settings.portal) else {
            return;
        };
        let Some(position) = transport.position() else {
            return;
        };
        if !same_block(&position, &lobby) {
            return;
        }
        self.log(LogKind::System, "In lobby, heading to the portal");
        let goal = Goal::Block {
            x: portal.x.floor() as i64,
            y: portal.y.floor() as i64,
            z: portal.z.floor() as i64,
        };
        if let Err(error) = transport.goto(goal).await {
            self.log(LogKind::Error, &format!("Failed to reach portal: {error}"));
            if let Err(error) = transport.chat(UNREACHABLE).await {
                tracing::debug!(target = "agent_fleet::connection", error = %error, "chat failed");
            }
        }
    }

    fn on_chat(&self, sender: &str, text: &str) {
        let own = self.username();
        if sender == own {
            return;
        }
        let is_primary = self.services().registry.is_first_bot(own);
        let mentions_me = text.to_lowercase().contains(&own.to_lowercase());
        if is_primary || mentions_me || text.starts_with('!') || text.starts_with('/') {
            self.log(LogKind::Chat, &format!("Chat message from {sender}: {text}"));
        }
    }

    async fn on_whisper(&self, sender: &str, text: &str) {
        self.log(LogKind::Whisper, &format!("Whisper from {sender}: {text}"));
        let prefix = &self.services().settings.command_prefix;
        let trimmed = text.trim_start();
        let Some(head) = trimmed.get(..prefix.len()) else {
            return;
        };
        if !head.eq_ignore_ascii_case(prefix) {
            return;
        }
        let rest = &trimmed[prefix.len()..];
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return;
        }
        if let Err(refusal) = self.handle_remote_command(sender, rest).await {
            tracing::debug!(target = "agent_fleet::connection", agent = %self.username(), ?refusal, "whisper command refused");
        }
    }

    fn on_message(&self, message: &ChatMessage) {
        let text = message.to_plain_text();
        if text.trim().is_empty() {
            return;
        }
        self.log(LogKind::System, &format!("System Message: {text}"));
        if message.is_private() {
            self.log(LogKind::Whisper, &text);
        }
    }

    fn on_error(&self, error: TransportError) {
        self.log(LogKind::Error, &format!("Transport error: {error}"));
        if error.is_network_fault() {
            self.set_phase(Phase::Reconnecting);
            self.schedule_reconnect(ReconnectCause::NetworkFault);
        }
    }

    async fn on_end(&self, id: u64, reason: &str) {
        let session = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|current| current.id == id) {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        self.set_phase(Phase::Disconnected);

        let username = self.username().to_string();
        let patch = AgentRecordPatch {
            state: Some(AgentState::Stopped),
            farm: Some(None),
            ..Default::default()
        };
        if let Err(error) = self.services().state.update_bot(&username, patch) {
            self.log(LogKind::Error, &format!("Failed to record disconnect: {error}"));
        }
        self.services().registry.remove_bot(&username);

        self.log(LogKind::System, &format!("Disconnected: {reason}"));
        self.notify(Notification::bot_status(&username, &format!("Disconnected: {reason}")));
        self.services()
            .events
            .emit("disconnected", json!({ "agent": username, "reason": reason }));
        self.schedule_reconnect(ReconnectCause::Disconnected);
    }

    fn schedule_reconnect(&self, cause: ReconnectCause) {
        let decision = self.inner.supervisor.lock().request(cause, Instant::now());
        let pending = match decision {
            ReconnectDecision::Schedule(pending) => pending,
            ReconnectDecision::AlreadyPending(pending) => {
                tracing::debug!(
                    target = "agent_fleet::connection",
                    agent = %self.username(),
                    cause = pending.cause.as_str(),
                    "reconnect already pending"
                );
                return;
            }
            ReconnectDecision::Stopped => return,
        };

        self.log(
            LogKind::System,
            &format!("Reconnecting in {} seconds", pending.delay.as_secs()),
        );
        self.services().events.emit(
            "reconnect_scheduled",
            json!({ "agent": self.username(), "cause": cause.as_str(), "delay_secs": pending.delay.as_secs() }),
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(pending.due).await;
            this.inner.reconnect_task.lock().take();
            let attempt = this.inner.supervisor.lock().on_attempt();
            tracing::info!(target = "agent_fleet::connection", agent = %this.username(), attempt, "reconnecting");
            this.connect().await;
        });
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Authorize and run a command received in a private message.
    pub async fn handle_remote_command(
        &self,
        sender: &str,
        text: &str,
    ) -> Result<CommandOutcome, Refusal> {
        let requester = base_username(sender);
        let Some(invocation) = Invocation::parse(text) else {
            return Ok(CommandOutcome::Unknown(String::new()));
        };
        let transport = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.transport));
        let Some(transport) = transport else {
            return Ok(CommandOutcome::Failed("not connected".into()));
        };

        self.log(
            LogKind::Command,
            &format!("Command from {requester}: {}", invocation.name),
        );

        let services = self.services();
        let ctx = GuardContext::new(
            requester,
            &invocation,
            &services.whitelist,
            services.command_password.as_deref(),
            services.scheduler.group_for(self.username()),
        );

        if let Err(refusal) = commands::check(&invocation, &ctx) {
            if let Err(error) = transport.whisper(requester, refusal.message()).await {
                tracing::debug!(target = "agent_fleet::connection", error = %error, "refusal whisper failed");
            }
            match refusal {
                Refusal::DutyLocked => {
                    self.log(
                        LogKind::Command,
                        &format!("Refused {} from {requester}: on farm duty", invocation.name),
                    );
                }
                Refusal::Unauthorized => {
                    let message = format!(
                        "Unauthorized command attempt from {requester} on bot {}: {}",
                        self.username(),
                        invocation.name
                    );
                    self.log(LogKind::Security, &message);
                    self.notify(Notification::security(message));
                }
            }
            return Err(refusal);
        }

        let outcome = commands::dispatch(&invocation, requester, &ctx, transport.as_ref()).await;
        match &outcome {
            CommandOutcome::Suppressed(text) => {
                self.log(LogKind::Chat, &format!("Suppressed message: {text}"));
            }
            CommandOutcome::Unknown(name) => {
                self.log(LogKind::Command, &format!("Unknown command: {name}"));
            }
            CommandOutcome::Failed(error) => {
                self.log(LogKind::Error, &format!("Command {} failed: {error}", invocation.name));
            }
            _ => {}
        }
        Ok(outcome)
    }
}

/// Run `task` until it finishes or the session is cancelled.
fn spawn_in_session<F>(cancel: &CancellationToken, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = task => {}
        }
    });
}

fn same_block(a: &Vec3, b: &Vec3) -> bool {
    a.x.floor() == b.x.floor() && a.y.floor() == b.y.floor() && a.z.floor() == b.z.floor()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::duties::DutyGroup;
    use crate::notify::RecordingSink;
    use crate::transport::fake::{Call, FakeFactory, FakeTransport, World};
    use crate::transport::PlayerInfo;

    const STATUS: &str = "Bot Status Update";
    const SECURITY: &str = "Security Alert";

    struct Harness {
        _dir: tempfile::TempDir,
        factory: Arc<FakeFactory>,
        sink: Arc<RecordingSink>,
        services: FleetServices,
    }

    fn harness(farms: Vec<DutyGroup>, settings: FleetSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("cache.json")));
        let factory = FakeFactory::new();
        let sink = Arc::new(RecordingSink::default());
        let services = FleetServices {
            registry: Arc::new(AgentRegistry::new()),
            dedup: Arc::new(MessageDedup::default()),
            state: state.clone(),
            notifier: sink.clone(),
            factory: factory.clone(),
            scheduler: Arc::new(DutyScheduler::new(farms, state)),
            whitelist: Arc::new(Whitelist::new(["alice".to_string()])),
            settings: Arc::new(settings),
            events: EventEmitter::new(false),
            command_password: Some("hunter2".into()),
            shutdown: CancellationToken::new(),
        };
        Harness {
            _dir: dir,
            factory,
            sink,
            services,
        }
    }

    fn profile(name: &str) -> AgentProfile {
        AgentProfile {
            username: name.into(),
            host: "play.example.net".into(),
            port: 25565,
            version: "1.20.1".into(),
            auth: "offline".into(),
            password: Some("serverpw".into()),
        }
    }

    fn locked_farm() -> DutyGroup {
        DutyGroup {
            name: "Gold Farm".into(),
            bots: vec!["miner1".into()],
            duties: BTreeMap::from([("miner1".to_string(), vec!["jump".to_string()])]),
            allow_teleport: false,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn send(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
        tx.send(event).await.unwrap();
        settle().await;
    }

    async fn connected(h: &Harness, name: &str) -> (ConnectionManager, Arc<FakeTransport>, mpsc::Sender<TransportEvent>) {
        let manager = ConnectionManager::new(profile(name), h.services.clone());
        manager.connect().await;
        let (transport, tx) = h.factory.last();
        (manager, transport, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_registers_and_reports_status() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (first, _, _) = connected(&h, "miner1").await;
        let (_second, _, _) = connected(&h, "miner2").await;
        settle().await;

        assert!(first.is_connected());
        assert_eq!(h.services.registry.primary().as_deref(), Some("miner1"));
        assert_eq!(h.services.registry.get_bot_count(), 2);
        assert_eq!(h.sink.count_titled(STATUS), 2);
        assert_eq!(first.phase(), Phase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_prefers_cached_server() {
        let h = harness(Vec::new(), FleetSettings::default());
        h.services
            .state
            .upsert_bot(AgentRecord {
                username: "miner1".into(),
                server_address: "backup.example.net".into(),
                auth_method: "microsoft".into(),
                state: AgentState::Stopped,
                farm: None,
                updated_at: None,
            })
            .unwrap();
        connected(&h, "miner1").await;
        let options = h.factory.connects.lock()[0].clone();
        assert_eq!(options.host, "backup.example.net");
        assert_eq!(options.auth, "microsoft");
    }

    #[tokio::test(start_paused = true)]
    async fn login_sends_credentials_and_records_running() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Login).await;

        assert_eq!(manager.phase(), Phase::LoggedIn);
        assert_eq!(transport.chats(), vec!["/login serverpw"]);
        let record = h.services.state.get_bot("miner1").unwrap();
        assert_eq!(record.state, AgentState::Running);
        assert_eq!(record.server_address, "play.example.net");
    }

    #[tokio::test(start_paused = true)]
    async fn end_stops_record_and_reconnects_after_disconnect_delay() {
        let h = harness(vec![locked_farm()], FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Login).await;
        send(&tx, TransportEvent::Spawn).await;
        assert_eq!(
            h.services.state.get_bot("miner1").unwrap().farm.as_deref(),
            Some("Gold Farm")
        );

        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;
        let record = h.services.state.get_bot("miner1").unwrap();
        assert_eq!(record.state, AgentState::Stopped);
        assert_eq!(record.farm, None);
        assert_eq!(h.services.registry.get_bot_count(), 0);
        // connected, spawned, disconnected
        assert_eq!(h.sink.count_titled(STATUS), 3);
        let pending = manager.pending_reconnect().unwrap();
        assert_eq!(pending.cause, ReconnectCause::Disconnected);
        assert_eq!(pending.delay, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert_eq!(h.factory.connect_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.factory.connect_count(), 2);
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duties_stop_when_session_ends() {
        let h = harness(vec![locked_farm()], FleetSettings::default());
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Spawn).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let jumps = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Control(Control::Jump, true)))
            .count();
        assert!(jumps >= 1);

        send(&tx, TransportEvent::End { reason: "bye".into() }).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let before = transport.calls().len();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(transport.calls().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_reconnects_after_longer_delay() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        send(
            &tx,
            TransportEvent::Error(TransportError::with_code("ECONNREFUSED", "refused")),
        )
        .await;
        send(&tx, TransportEvent::End { reason: "socket closed".into() }).await;

        let pending = manager.pending_reconnect().unwrap();
        assert_eq!(pending.cause, ReconnectCause::NetworkFault);
        assert_eq!(pending.delay, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.factory.connect_count(), 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_do_not_reconnect() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Error(TransportError::new("bad packet"))).await;
        assert!(manager.pending_reconnect().is_none());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_retried() {
        let h = harness(Vec::new(), FleetSettings::default());
        h.factory
            .failures
            .lock()
            .push_back(TransportError::with_code("ENOTFOUND", "no such host"));
        let manager = ConnectionManager::new(profile("miner1"), h.services.clone());
        manager.connect().await;
        assert!(!manager.is_connected());
        assert_eq!(
            manager.pending_reconnect().map(|p| p.delay),
            Some(Duration::from_secs(30))
        );
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reconnect() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;
        assert!(manager.pending_reconnect().is_some());

        manager.shutdown().await;
        assert!(manager.pending_reconnect().is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_shutdown_abandons_reconnect_in_flight() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        *h.factory.connect_delay.lock() = Some(Duration::from_secs(5));
        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.factory.connect_count(), 2);
        h.services.shutdown.cancel();
        manager.shutdown().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!manager.is_connected());
        assert_eq!(manager.phase(), Phase::Disconnected);
        assert_eq!(h.services.registry.get_bot_count(), 0);
        assert_eq!(h.factory.transports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_opened_after_shutdown_is_closed() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, _transport, tx) = connected(&h, "miner1").await;
        *h.factory.connect_delay.lock() = Some(Duration::from_secs(5));
        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!manager.is_connected());
        assert_eq!(h.services.registry.get_bot_count(), 0);
        let (late, _) = h.factory.last();
        assert_eq!(late.calls(), vec![Call::Quit("connection not needed".into())]);
        assert_eq!(h.factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_connects_keep_one_session() {
        let h = harness(Vec::new(), FleetSettings::default());
        *h.factory.connect_delay.lock() = Some(Duration::from_secs(1));
        let manager = ConnectionManager::new(profile("miner1"), h.services.clone());
        tokio::join!(manager.connect(), manager.connect());

        assert!(manager.is_connected());
        assert_eq!(h.services.registry.get_bot_count(), 1);
        let transports = h.factory.transports();
        assert_eq!(transports.len(), 2);
        let closed = transports
            .iter()
            .filter(|t| t.calls().contains(&Call::Quit("connection not needed".into())))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_quits_transport() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, transport, _tx) = connected(&h, "miner1").await;
        manager.disconnect().await;
        assert_eq!(transport.calls(), vec![Call::Quit("disconnect requested".into())]);

        let idle = ConnectionManager::new(profile("miner2"), h.services.clone());
        idle.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duty_lock_refuses_teleport_even_for_whitelisted() {
        let h = harness(vec![locked_farm()], FleetSettings::default());
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(
            &tx,
            TransportEvent::Whisper {
                sender: "alice".into(),
                text: "fleet tpme hunter2".into(),
            },
        )
        .await;
        assert_eq!(
            transport.whispers(),
            vec![("alice".to_string(), commands::DUTY_REFUSAL.to_string())]
        );
        assert!(transport.chats().is_empty());
        assert_eq!(h.sink.count_titled(SECURITY), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn password_authorizes_unlisted_sender() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, transport, _tx) = connected(&h, "miner1").await;
        let outcome = manager
            .handle_remote_command("[VIP] bob", "tpme hunter2")
            .await;
        assert_eq!(outcome, Ok(CommandOutcome::Teleport("/tpahere bob".into())));
        assert_eq!(transport.chats(), vec!["/tpahere bob"]);
        assert_eq!(h.sink.count_titled(SECURITY), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_is_refused_with_one_alert() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (manager, transport, _tx) = connected(&h, "miner1").await;
        let outcome = manager.handle_remote_command("bob", "tpme guess").await;
        settle().await;
        assert_eq!(outcome, Err(Refusal::Unauthorized));
        assert!(transport.chats().is_empty());
        assert_eq!(
            transport.whispers(),
            vec![("bob".to_string(), commands::UNAUTHORIZED_REFUSAL.to_string())]
        );
        assert_eq!(h.sink.count_titled(SECURITY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn whisper_without_prefix_is_not_a_command() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        for text in ["tpme", "fleetwood tpme", "hello"] {
            send(
                &tx,
                TransportEvent::Whisper {
                    sender: "alice".into(),
                    text: text.into(),
                },
            )
            .await;
        }
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn say_from_password_holder_drops_password() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(
            &tx,
            TransportEvent::Whisper {
                sender: "bob".into(),
                text: "fleet say hi everyone hunter2".into(),
            },
        )
        .await;
        assert_eq!(transport.chats(), vec!["hi everyone"]);
    }

    #[tokio::test(start_paused = true)]
    async fn login_probe_resends_when_agent_is_stuck() {
        let settings = FleetSettings {
            login_check_hosts: vec!["play.example.net".into()],
            ..FleetSettings::default()
        };
        let h = harness(Vec::new(), settings);
        *h.factory.world.lock() = Some(World {
            position: Some(Vec3::new(10.0, 64.0, 10.0)),
            positions_after_forward: [Vec3::new(10.1, 64.0, 10.0)].into(),
            ..World::default()
        });
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Login).await;
        send(&tx, TransportEvent::Spawn).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(transport.chats(), vec!["/login serverpw", "/login serverpw"]);
    }

    #[tokio::test(start_paused = true)]
    async fn login_probe_confirms_when_agent_moves() {
        let settings = FleetSettings {
            login_check_hosts: vec!["PLAY.example.net".into()],
            ..FleetSettings::default()
        };
        let h = harness(Vec::new(), settings);
        *h.factory.world.lock() = Some(World {
            position: Some(Vec3::new(10.0, 64.0, 10.0)),
            positions_after_forward: [Vec3::new(13.0, 64.0, 10.0)].into(),
            ..World::default()
        });
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Login).await;
        send(&tx, TransportEvent::Spawn).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(transport.chats(), vec!["/login serverpw"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lobby_spawn_heads_to_portal_and_reports_failure() {
        let settings = FleetSettings {
            portal: Some(Vec3::new(-60.0, 40.0, 12.0)),
            ..FleetSettings::default()
        };
        let h = harness(Vec::new(), settings);
        *h.factory.world.lock() = Some(World {
            position: Some(Vec3::new(-70.5, 38.0, -4.5)),
            fail_goto: true,
            ..World::default()
        });
        let (_manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Spawn).await;

        assert!(transport
            .calls()
            .contains(&Call::Goto(Goal::Block { x: -60, y: 40, z: 12 })));
        assert_eq!(transport.chats(), vec![UNREACHABLE]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_respawn_walk_does_not_hold_up_events() {
        let settings = FleetSettings {
            portal: Some(Vec3::new(-60.0, 40.0, 12.0)),
            ..FleetSettings::default()
        };
        let h = harness(Vec::new(), settings);
        *h.factory.world.lock() = Some(World {
            position: Some(Vec3::new(-70.5, 38.0, -4.5)),
            goto_delay: Some(Duration::from_secs(120)),
            ..World::default()
        });
        let (manager, transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Spawn).await;
        send(&tx, TransportEvent::Spawn).await;
        let walks = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Goto(_)))
            .count();
        assert_eq!(walks, 2);

        send(
            &tx,
            TransportEvent::Whisper {
                sender: "alice".into(),
                text: "fleet tpme".into(),
            },
        )
        .await;
        assert_eq!(transport.chats(), vec!["/tpahere alice"]);

        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;
        assert!(!manager.is_connected());
        assert_eq!(
            manager.pending_reconnect().map(|p| p.cause),
            Some(ReconnectCause::Disconnected)
        );
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(h.factory.connect_count(), 2);
        assert!(!transport.chats().contains(&UNREACHABLE.to_string()));
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl NotificationSink for StalledSink {
        async fn send(&self, _notification: Notification) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_webhook_does_not_block_the_session() {
        let mut h = harness(Vec::new(), FleetSettings::default());
        h.services.notifier = Arc::new(StalledSink);
        let (manager, transport, tx) = connected(&h, "miner1").await;
        let (_other, _, _) = connected(&h, "miner2").await;
        assert_eq!(h.factory.connect_count(), 2);

        send(&tx, TransportEvent::Health(2.0)).await;
        send(
            &tx,
            TransportEvent::Whisper {
                sender: "mallory".into(),
                text: "fleet tpme".into(),
            },
        )
        .await;
        assert_eq!(
            transport.whispers(),
            vec![("mallory".to_string(), commands::UNAUTHORIZED_REFUSAL.to_string())]
        );

        send(&tx, TransportEvent::End { reason: "kicked".into() }).await;
        assert!(manager.pending_reconnect().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn low_health_warns_once_per_cooldown() {
        let h = harness(Vec::new(), FleetSettings::default());
        let (_manager, _transport, tx) = connected(&h, "miner1").await;
        send(&tx, TransportEvent::Health(4.0)).await;
        send(&tx, TransportEvent::Health(3.0)).await;
        send(&tx, TransportEvent::Health(18.0)).await;
        assert_eq!(h.sink.count_titled("⚠️ Low Health Warning"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_command_targets_visible_requester() {
        let h = harness(Vec::new(), FleetSettings::default());
        *h.factory.world.lock() = Some(World {
            players: vec![PlayerInfo {
                username: "alice".into(),
                position: Some(Vec3::new(5.0, 64.0, 5.0)),
            }],
            ..World::default()
        });
        let (manager, transport, _tx) = connected(&h, "miner1").await;
        let outcome = manager.handle_remote_command("alice", "follow me 3").await;
        assert_eq!(
            outcome,
            Ok(CommandOutcome::Following {
                target: "alice".into(),
                distance: 3.0
            })
        );
        assert_eq!(
            transport.calls(),
            vec![Call::SetGoal(Goal::Near {
                x: 5.0,
                y: 64.0,
                z: 5.0,
                range: 3.0
            })]
        );
    }
}
