//! Background duties an agent performs while working a duty group ("farm").
//!
//! Each duty is its own task with its own cadence, so a duty that has nothing
//! to do (no target, no weapon) never holds up the others. All tasks of a
//! session hang off the session's cancellation token.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::state::{AgentRecordPatch, StateStore};
use crate::transport::{AgentTransport, Control, EntityQuery, EquipSlot, Item};

/// Farm whose piglin duty turns to scan when nothing is in reach.
const SCANNING_FARM: &str = "Gold Farm";
const PIGLIN: &str = "zombified_piglin";
const WITHER_SKELETON: &str = "wither_skeleton";
const GHAST: &str = "ghast";
const PIGLIN_RANGE: f64 = 6.0;
const RAID_RADIUS: f64 = 6.0;
const RAID_MOBS: &[&str] = &[
    "pillager",
    "vindicator",
    "evoker",
    "ravager",
    "witch",
    "vex",
    "illusioner",
];
const JUMP_HOLD: Duration = Duration::from_millis(100);
const OMINOUS_ITEM: &str = "ominous_bottle";
const OMINOUS_SIGNATURE: &str = "bad_omen";

/// Weapon materials, best first.
const WEAPON_TIERS: &[&str] = &["netherite", "diamond", "iron", "stone", "golden", "wooden"];
const WEAPON_KINDS: &[&str] = &["_sword", "_axe"];

fn default_true() -> bool {
    true
}

/// A named group of agents and the duties each of them runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutyGroup {
    pub name: String,
    #[serde(default)]
    pub bots: Vec<String>,
    /// Duty identifiers keyed by agent username.
    #[serde(default)]
    pub duties: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_true", alias = "allowTeleport")]
    pub allow_teleport: bool,
}

impl DutyGroup {
    pub fn has_member(&self, username: &str) -> bool {
        self.bots.iter().any(|b| b == username)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Duty {
    Jump,
    HitPiglin,
    HitWitherSkeleton,
    HitGhast,
    RaidFarm,
    DrinkOminousPotion,
}

impl Duty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jump => "jump",
            Self::HitPiglin => "hitPiglin",
            Self::HitWitherSkeleton => "hitWitherSkeleton",
            Self::HitGhast => "hitGhast",
            Self::RaidFarm => "raidfarm",
            Self::DrinkOminousPotion => "drinkOminousPotion",
        }
    }

    /// Delay before the next cycle. Jumping is deliberately irregular.
    fn next_delay(&self) -> Duration {
        match self {
            Self::Jump => Duration::from_millis(rand::thread_rng().gen_range(2_000..4_000)),
            Self::HitPiglin | Self::HitWitherSkeleton | Self::HitGhast => Duration::from_secs(2),
            Self::RaidFarm => Duration::from_secs(5),
            Self::DrinkOminousPotion => Duration::from_secs(130),
        }
    }
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown duty: {0}")]
pub struct UnknownDuty(pub String);

impl FromStr for Duty {
    type Err = UnknownDuty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jump" => Ok(Self::Jump),
            "hitPiglin" => Ok(Self::HitPiglin),
            "hitWitherSkeleton" => Ok(Self::HitWitherSkeleton),
            "hitGhast" => Ok(Self::HitGhast),
            "raidfarm" => Ok(Self::RaidFarm),
            "drinkOminousPotion" => Ok(Self::DrinkOminousPotion),
            other => Err(UnknownDuty(other.to_string())),
        }
    }
}

/// What a single duty cycle did; only used for logging.
#[derive(Debug, Clone, PartialEq)]
enum Cycle {
    Acted(String),
    Idle(&'static str),
}

/// Starts duty tasks for agents and records their group assignment.
#[derive(Debug, Clone)]
pub struct DutyScheduler {
    groups: Vec<DutyGroup>,
    state: Arc<StateStore>,
}

impl DutyScheduler {
    pub fn new(groups: Vec<DutyGroup>, state: Arc<StateStore>) -> Self {
        Self { groups, state }
    }

    pub fn groups(&self) -> &[DutyGroup] {
        &self.groups
    }

    /// The first group that lists `username` as a member or assigns it duties.
    pub fn group_for(&self, username: &str) -> Option<&DutyGroup> {
        self.groups
            .iter()
            .find(|g| g.has_member(username) || g.duties.contains_key(username))
    }

    /// Start every duty configured for the transport's agent. Tasks stop when
    /// `cancel` fires.
    pub fn assign_duties(
        &self,
        transport: Arc<dyn AgentTransport>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let username = transport.username();
        let mut handles = Vec::new();

        for group in &self.groups {
            let Some(duties) = group.duties.get(&username) else {
                tracing::info!(
                    target = "agent_fleet::duties",
                    agent = %username,
                    farm = %group.name,
                    "no duties assigned"
                );
                continue;
            };

            tracing::info!(
                target = "agent_fleet::duties",
                agent = %username,
                farm = %group.name,
                duties = %duties.join(", "),
                "assigning duties"
            );

            let patch = AgentRecordPatch {
                farm: Some(Some(group.name.clone())),
                ..Default::default()
            };
            if let Err(error) = self.state.update_bot(&username, patch) {
                tracing::warn!(
                    target = "agent_fleet::duties",
                    agent = %username,
                    error = %error,
                    "failed to record farm assignment"
                );
            }

            for id in duties {
                match id.parse::<Duty>() {
                    Ok(duty) => handles.push(spawn_duty(
                        duty,
                        Arc::clone(&transport),
                        group.name.clone(),
                        cancel.child_token(),
                    )),
                    Err(error) => tracing::warn!(
                        target = "agent_fleet::duties",
                        agent = %username,
                        error = %error,
                        "skipping duty"
                    ),
                }
            }
        }

        handles
    }
}

fn spawn_duty(
    duty: Duty,
    transport: Arc<dyn AgentTransport>,
    farm: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let agent = transport.username();
        tracing::info!(target = "agent_fleet::duties", agent = %agent, duty = %duty, "starting duty");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(duty.next_delay()) => {}
            }
            match run_cycle(duty, transport.as_ref(), &farm).await {
                Ok(Cycle::Acted(what)) => {
                    tracing::debug!(target = "agent_fleet::duties", agent = %agent, duty = %duty, "{what}")
                }
                Ok(Cycle::Idle(why)) => {
                    tracing::trace!(target = "agent_fleet::duties", agent = %agent, duty = %duty, "{why}")
                }
                Err(error) => tracing::debug!(
                    target = "agent_fleet::duties",
                    agent = %agent,
                    duty = %duty,
                    error = %error,
                    "duty cycle failed"
                ),
            }
        }
        tracing::debug!(target = "agent_fleet::duties", agent = %agent, duty = %duty, "duty stopped");
    })
}

async fn run_cycle(
    duty: Duty,
    transport: &dyn AgentTransport,
    farm: &str,
) -> Result<Cycle, TransportError> {
    match duty {
        Duty::Jump => {
            transport.set_control_state(Control::Jump, true).await?;
            tokio::time::sleep(JUMP_HOLD).await;
            transport.set_control_state(Control::Jump, false).await?;
            Ok(Cycle::Acted("jumped".into()))
        }
        Duty::HitPiglin => {
            let query = EntityQuery::named(PIGLIN).within(PIGLIN_RANGE);
            if let Some(target) = transport.nearest_entity(&query) {
                transport.attack(&target).await?;
                return Ok(Cycle::Acted("attacking piglin".into()));
            }
            if farm != SCANNING_FARM {
                return Ok(Cycle::Idle("no piglin in range"));
            }
            let yaw = transport.orientation().map(|o| o.yaw).unwrap_or(0.0);
            transport
                .look(yaw + std::f64::consts::FRAC_PI_2, 0.0)
                .await?;
            Ok(Cycle::Acted("no piglin in range, turning right".into()))
        }
        Duty::HitWitherSkeleton => melee(transport, WITHER_SKELETON).await,
        Duty::HitGhast => melee(transport, GHAST).await,
        Duty::RaidFarm => {
            if let Some(weapon) = best_melee_weapon(&transport.inventory()) {
                transport.equip(&weapon, EquipSlot::Hand).await?;
            }
            let targets = transport.entities(&EntityQuery::any_of(RAID_MOBS).within(RAID_RADIUS));
            if targets.is_empty() {
                return Ok(Cycle::Idle("no raiders in range"));
            }
            for target in &targets {
                transport.attack(target).await?;
            }
            Ok(Cycle::Acted(format!("attacked {} raiders", targets.len())))
        }
        Duty::DrinkOminousPotion => {
            let Some(potion) = transport.inventory().into_iter().find(is_ominous) else {
                return Ok(Cycle::Idle("no ominous potion in inventory"));
            };
            transport.equip(&potion, EquipSlot::Hand).await?;
            transport.activate_item().await?;
            Ok(Cycle::Acted("drinking ominous potion".into()))
        }
    }
}

async fn melee(transport: &dyn AgentTransport, kind: &'static str) -> Result<Cycle, TransportError> {
    let Some(target) = transport.nearest_entity(&EntityQuery::named(kind)) else {
        return Ok(Cycle::Idle("no target"));
    };
    let Some(weapon) = best_melee_weapon(&transport.inventory()) else {
        tracing::info!(
            target = "agent_fleet::duties",
            agent = %transport.username(),
            kind,
            "no melee weapon available, skipping attack"
        );
        return Ok(Cycle::Idle("no weapon"));
    };
    transport.equip(&weapon, EquipSlot::Hand).await?;
    transport.attack(&target).await?;
    Ok(Cycle::Acted(format!("attacking {kind} with {}", weapon.name)))
}

/// Highest-tier sword, then axe, in the inventory.
pub fn best_melee_weapon(inventory: &[Item]) -> Option<Item> {
    inventory
        .iter()
        .filter_map(|item| weapon_rank(&item.name).map(|rank| (rank, item)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, item)| item.clone())
}

fn weapon_rank(name: &str) -> Option<(usize, usize)> {
    let kind = WEAPON_KINDS.iter().position(|k| name.ends_with(k))?;
    let tier = WEAPON_TIERS
        .iter()
        .position(|t| name.strip_prefix(t).is_some_and(|rest| rest.starts_with('_')))?;
    Some((tier, kind))
}

fn is_ominous(item: &Item) -> bool {
    item.name == OMINOUS_ITEM
        || item
            .tag
            .as_deref()
            .is_some_and(|tag| tag.contains(OMINOUS_SIGNATURE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgentRecord, AgentState};
    use crate::transport::fake::{Call, FakeTransport};
    use crate::transport::{Entity, Orientation, Vec3};

    fn item(name: &str, slot: u32) -> Item {
        Item {
            name: name.to_string(),
            slot,
            count: 1,
            tag: None,
        }
    }

    fn group(name: &str, agent: &str, duties: &[&str]) -> DutyGroup {
        DutyGroup {
            name: name.to_string(),
            bots: vec![agent.to_string()],
            duties: BTreeMap::from([(
                agent.to_string(),
                duties.iter().map(|d| d.to_string()).collect(),
            )]),
            allow_teleport: true,
        }
    }

    fn store_with(agent: &str) -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("cache.json")));
        store
            .upsert_bot(AgentRecord {
                username: agent.to_string(),
                server_address: "h".into(),
                auth_method: "offline".into(),
                state: AgentState::Running,
                farm: None,
                updated_at: None,
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn parses_known_duties() {
        assert_eq!("raidfarm".parse::<Duty>(), Ok(Duty::RaidFarm));
        assert_eq!("hitGhast".parse::<Duty>(), Ok(Duty::HitGhast));
        assert!("dance".parse::<Duty>().is_err());
    }

    #[test]
    fn group_deserializes_legacy_teleport_flag() {
        let group: DutyGroup = serde_json::from_str(
            r#"{"name":"Gold Farm","bots":["a"],"duties":{"a":["jump"]},"allowTeleport":false}"#,
        )
        .unwrap();
        assert!(!group.allow_teleport);
        let open: DutyGroup = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(open.allow_teleport);
    }

    #[test]
    fn prefers_higher_tier_weapons() {
        let inventory = vec![
            item("iron_sword", 0),
            item("bread", 1),
            item("diamond_axe", 2),
            item("diamond_sword", 3),
            item("wooden_sword", 4),
        ];
        assert_eq!(best_melee_weapon(&inventory).unwrap().name, "diamond_sword");
        assert!(best_melee_weapon(&[item("bread", 0)]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn assigns_duties_and_records_farm() {
        let (_dir, store) = store_with("a");
        let scheduler = DutyScheduler::new(
            vec![group("Gold Farm", "a", &["hitPiglin", "moonwalk"])],
            store.clone(),
        );
        let fake = Arc::new(FakeTransport::new("a"));
        fake.world.lock().position = Some(Vec3::new(0.0, 0.0, 0.0));
        fake.world.lock().entities.push(Entity {
            id: 7,
            name: PIGLIN.into(),
            position: Vec3::new(1.0, 0.0, 1.0),
        });

        let cancel = CancellationToken::new();
        let handles = scheduler.assign_duties(fake.clone(), &cancel);
        assert_eq!(handles.len(), 1);
        assert_eq!(store.get_bot("a").unwrap().farm.as_deref(), Some("Gold Farm"));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(fake.calls(), vec![Call::Attack(7)]);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gold_farm_turns_when_no_piglin() {
        let (_dir, store) = store_with("a");
        let scheduler = DutyScheduler::new(vec![group("Gold Farm", "a", &["hitPiglin"])], store);
        let fake = Arc::new(FakeTransport::new("a"));
        fake.world.lock().orientation = Some(Orientation { yaw: 0.0, pitch: 0.0 });

        let cancel = CancellationToken::new();
        scheduler.assign_duties(fake.clone(), &cancel);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        cancel.cancel();

        assert_eq!(
            fake.calls(),
            vec![Call::Look(std::f64::consts::FRAC_PI_2, 0.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn melee_duty_skips_without_weapon() {
        let (_dir, store) = store_with("a");
        let scheduler = DutyScheduler::new(vec![group("Nether", "a", &["hitGhast"])], store);
        let fake = Arc::new(FakeTransport::new("a"));
        fake.world.lock().entities.push(Entity {
            id: 3,
            name: GHAST.into(),
            position: Vec3::new(10.0, 0.0, 0.0),
        });

        let cancel = CancellationToken::new();
        scheduler.assign_duties(fake.clone(), &cancel);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(fake.calls().is_empty());

        fake.world.lock().inventory.push(item("netherite_sword", 0));
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        assert_eq!(
            fake.calls(),
            vec![
                Call::Equip("netherite_sword".into(), EquipSlot::Hand),
                Call::Attack(3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn raid_duty_attacks_every_raider_in_radius() {
        let (_dir, store) = store_with("a");
        let scheduler = DutyScheduler::new(vec![group("Raid", "a", &["raidfarm"])], store);
        let fake = Arc::new(FakeTransport::new("a"));
        {
            let mut world = fake.world.lock();
            world.position = Some(Vec3::new(0.0, 0.0, 0.0));
            world.inventory.push(item("iron_axe", 0));
            for (id, name, x) in [(1, "pillager", 2.0), (2, "witch", 3.0), (3, "vindicator", 40.0), (4, "cow", 1.0)] {
                world.entities.push(Entity {
                    id,
                    name: name.into(),
                    position: Vec3::new(x, 0.0, 0.0),
                });
            }
        }

        let cancel = CancellationToken::new();
        scheduler.assign_duties(fake.clone(), &cancel);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        cancel.cancel();

        assert_eq!(
            fake.calls(),
            vec![
                Call::Equip("iron_axe".into(), EquipSlot::Hand),
                Call::Attack(1),
                Call::Attack(2)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn potion_duty_drinks_tagged_item() {
        let (_dir, store) = store_with("a");
        let scheduler = DutyScheduler::new(vec![group("Raid", "a", &["drinkOminousPotion"])], store);
        let fake = Arc::new(FakeTransport::new("a"));
        fake.world.lock().inventory = vec![
            item("potion", 0),
            Item {
                name: "potion".into(),
                slot: 5,
                count: 1,
                tag: Some(r#"{"potion_contents":"minecraft:bad_omen"}"#.into()),
            },
        ];

        let cancel = CancellationToken::new();
        scheduler.assign_duties(fake.clone(), &cancel);
        tokio::time::sleep(Duration::from_secs(131)).await;
        cancel.cancel();

        assert_eq!(
            fake.calls(),
            vec![Call::Equip("potion".into(), EquipSlot::Hand), Call::Activate]
        );
    }

    #[tokio::test]
    async fn agents_without_duties_are_skipped() {
        let (_dir, store) = store_with("b");
        let scheduler = DutyScheduler::new(vec![group("Gold Farm", "a", &["jump"])], store.clone());
        let fake = Arc::new(FakeTransport::new("b"));
        let handles = scheduler.assign_duties(fake, &CancellationToken::new());
        assert!(handles.is_empty());
        assert_eq!(store.get_bot("b").unwrap().farm, None);
    }
}
