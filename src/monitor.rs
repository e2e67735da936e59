//! Health and player-proximity watchers that run while an agent is spawned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{AgentLog, LogKind};
use crate::notify::NotificationSink;
use crate::transport::AgentTransport;
use crate::whitelist::Whitelist;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub health_threshold: f32,
    pub health_cooldown: Duration,
    pub proximity_radius: f64,
    pub proximity_interval: Duration,
    pub proximity_cooldown: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            health_threshold: 5.0,
            health_cooldown: Duration::from_secs(10),
            proximity_radius: 10.0,
            proximity_interval: Duration::from_secs(5),
            proximity_cooldown: Duration::from_secs(30),
        }
    }
}

/// Decides whether a health reading warrants a warning.
#[derive(Debug)]
pub struct HealthMonitor {
    threshold: f32,
    cooldown: Duration,
    last_alert: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(threshold: f32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            last_alert: None,
        }
    }

    pub fn observe(&mut self, health: f32, now: Instant) -> bool {
        if health > self.threshold {
            return false;
        }
        if self
            .last_alert
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown)
        {
            return false;
        }
        self.last_alert = Some(now);
        true
    }
}

/// Tracks which strangers were already reported.
#[derive(Debug, Default)]
struct ProximityTracker {
    reported: HashMap<String, Instant>,
}

impl ProximityTracker {
    fn scan(
        &mut self,
        transport: &dyn AgentTransport,
        whitelist: &Whitelist,
        settings: &MonitorSettings,
        now: Instant,
    ) -> Vec<(String, f64)> {
        let Some(origin) = transport.position() else {
            return Vec::new();
        };
        let own = transport.username();
        self.reported
            .retain(|_, at| now.saturating_duration_since(*at) < settings.proximity_cooldown);

        let mut alerts = Vec::new();
        for player in transport.players() {
            if player.username == own || whitelist.contains(&player.username) {
                continue;
            }
            let Some(position) = player.position else {
                continue;
            };
            let distance = origin.distance_to(&position);
            if distance > settings.proximity_radius || self.reported.contains_key(&player.username) {
                continue;
            }
            self.reported.insert(player.username.clone(), now);
            alerts.push((player.username, distance));
        }
        alerts
    }
}

pub fn spawn_proximity_monitor(
    transport: Arc<dyn AgentTransport>,
    whitelist: Arc<Whitelist>,
    notifier: Arc<dyn NotificationSink>,
    log: AgentLog,
    settings: MonitorSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = ProximityTracker::default();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + settings.proximity_interval,
            settings.proximity_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let alerts = tracker.scan(transport.as_ref(), &whitelist, &settings, Instant::now());
            for (player, distance) in alerts {
                log.log(
                    LogKind::Security,
                    &format!("Non-whitelisted player {player} is {distance:.1} blocks away"),
                );
                notifier
                    .send_player_proximity_alert(log.agent(), &player, distance)
                    .await;
            }
        }
        tracing::debug!(target = "agent_fleet::monitor", agent = %log.agent(), "proximity monitor stopped");
    })
}
