#![allow(dead_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use statewright_common::{EngineConfig, EntityKey, EntityProperty, LogicalClock};
use statewright_engine::{
    BehaviourRegistry, Dispatcher, EngineDeps, Entity, EventLike, Machine, StateMachine,
    TransitionContext,
};
use statewright_store::MemoryStorage;

pub fn cook_time() -> TimeDelta {
    TimeDelta::seconds(30)
}

// ---------------------------------------------------------------------------
// Microwave: a door, a button and a cooking timer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrowaveState {
    Ready,
    Cooking,
    CookingComplete,
    CookingInterrupted,
}

impl fmt::Display for MicrowaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "READY",
            Self::Cooking => "COOKING",
            Self::CookingComplete => "COOKING_COMPLETE",
            Self::CookingInterrupted => "COOKING_INTERRUPTED",
        })
    }
}

impl FromStr for MicrowaveState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "COOKING" => Ok(Self::Cooking),
            "COOKING_COMPLETE" => Ok(Self::CookingComplete),
            "COOKING_INTERRUPTED" => Ok(Self::CookingInterrupted),
            other => Err(format!("unknown microwave state {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicrowaveData {
    pub power: i64,
    pub cook_count: u32,
    pub interruptions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MicrowaveEvent {
    Create { power: i64 },
    ButtonPressed,
    DoorOpened,
    DoorClosed,
    TimerExpired,
}

impl EventLike for MicrowaveEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Create { .. } => "Create",
            Self::ButtonPressed => "ButtonPressed",
            Self::DoorOpened => "DoorOpened",
            Self::DoorClosed => "DoorClosed",
            Self::TimerExpired => "TimerExpired",
        }
    }
}

pub struct Microwave;

impl StateMachine for Microwave {
    type State = MicrowaveState;
    type Snapshot = MicrowaveData;
    type Event = MicrowaveEvent;

    const ENTITY_TYPE: &'static str = "microwave";

    fn transition(
        &self,
        ctx: &mut TransitionContext,
        entity: Entity<'_, Self>,
        event: &MicrowaveEvent,
    ) -> Option<(MicrowaveState, MicrowaveData)> {
        use MicrowaveEvent as E;
        use MicrowaveState as S;

        let data = entity.snapshot.cloned().unwrap_or_default();
        match (entity.state, event) {
            (None, E::Create { power }) => Some((
                S::Ready,
                MicrowaveData {
                    power: *power,
                    ..data
                },
            )),
            (Some(S::Ready), E::ButtonPressed) => {
                ctx.signal_to_self_after(&E::TimerExpired, cook_time());
                Some((S::Cooking, data))
            }
            (Some(S::Cooking), E::TimerExpired) => {
                ctx.signal("tally", "kitchen", &TallyEvent::Add { value: 1 });
                Some((
                    S::CookingComplete,
                    MicrowaveData {
                        cook_count: data.cook_count + 1,
                        ..data
                    },
                ))
            }
            (Some(S::Cooking), E::DoorOpened) => {
                ctx.cancel_signals_to_self();
                Some((
                    S::CookingInterrupted,
                    MicrowaveData {
                        interruptions: data.interruptions + 1,
                        ..data
                    },
                ))
            }
            (Some(S::CookingInterrupted), E::DoorClosed) => Some((S::Ready, data)),
            (Some(S::CookingComplete), E::DoorOpened) => Some((S::Ready, data)),
            _ => None,
        }
    }

    fn properties(
        &self,
        _id: &str,
        state: MicrowaveState,
        data: &MicrowaveData,
    ) -> Vec<EntityProperty> {
        vec![
            EntityProperty::new("state", state.to_string()),
            EntityProperty::new("power", data.power.to_string()),
            EntityProperty::ranged(
                "state",
                state.to_string(),
                "cook_count",
                data.cook_count.into(),
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// Tally: records every value it is sent, in order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyState {
    Counting,
}

impl fmt::Display for TallyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("COUNTING")
    }
}

impl FromStr for TallyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COUNTING" => Ok(Self::Counting),
            other => Err(format!("unknown tally state {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TallyData {
    pub values: Vec<i64>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TallyEvent {
    Add { value: i64 },
    /// Rejected by the behaviour, so it never transitions.
    Ignore,
}

impl EventLike for TallyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Add { .. } => "Add",
            Self::Ignore => "Ignore",
        }
    }
}

pub struct Tally;

impl StateMachine for Tally {
    type State = TallyState;
    type Snapshot = TallyData;
    type Event = TallyEvent;

    const ENTITY_TYPE: &'static str = "tally";

    fn transition(
        &self,
        _ctx: &mut TransitionContext,
        entity: Entity<'_, Self>,
        event: &TallyEvent,
    ) -> Option<(TallyState, TallyData)> {
        match event {
            TallyEvent::Add { value } => {
                let mut data = entity.snapshot.cloned().unwrap_or_default();
                data.values.push(*value);
                data.total += value;
                Some((TallyState::Counting, data))
            }
            TallyEvent::Ignore => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub storage: Arc<MemoryStorage>,
    pub clock: Arc<LogicalClock>,
}

pub fn registry() -> Arc<BehaviourRegistry> {
    let mut registry = BehaviourRegistry::default();
    registry.register(Microwave).register(Tally);
    Arc::new(registry)
}

/// Timer and recovery tasks off: tests drive time explicitly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        timer_poll_interval_ms: 0,
        recovery_interval_ms: 0,
        max_workers: 4,
        lane_batch_size: 2,
        ..EngineConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_on(Arc::new(MemoryStorage::new()), test_config()).await
}

pub async fn harness_on(storage: Arc<MemoryStorage>, config: EngineConfig) -> Harness {
    let clock = Arc::new(LogicalClock::at_epoch());
    let deps = EngineDeps::builder()
        .storage(storage.clone())
        .registry(registry())
        .clock(clock.clone())
        .build();
    let dispatcher = Dispatcher::start(deps, config).await.unwrap();
    Harness {
        dispatcher,
        storage,
        clock,
    }
}

impl Harness {
    pub async fn microwave(&self, id: &str, event: MicrowaveEvent) -> i64 {
        self.dispatcher
            .signal_event("microwave", id, &event)
            .await
            .unwrap()
    }

    pub async fn tally(&self, id: &str, event: TallyEvent) -> i64 {
        self.dispatcher.signal_event("tally", id, &event).await.unwrap()
    }

    /// Advance the logical clock, fire whatever became due and wait for it.
    pub async fn advance(&self, by: TimeDelta) {
        self.clock.advance(by);
        self.dispatcher.fire_due().await.unwrap();
        self.dispatcher.idle().await;
    }

    pub async fn microwave_state(&self, id: &str) -> Option<MicrowaveState> {
        let machine = self
            .dispatcher
            .entity(&EntityKey::new("microwave", id))
            .await
            .unwrap()?;
        Machine::<Microwave>::downcast(machine.as_ref()).and_then(|m| m.typed_state())
    }

    pub async fn microwave_data(&self, id: &str) -> Option<MicrowaveData> {
        let machine = self
            .dispatcher
            .entity(&EntityKey::new("microwave", id))
            .await
            .unwrap()?;
        Machine::<Microwave>::downcast(machine.as_ref()).and_then(|m| m.snapshot().cloned())
    }

    pub async fn tally_values(&self, id: &str) -> Vec<i64> {
        let Some(machine) = self
            .dispatcher
            .entity(&EntityKey::new("tally", id))
            .await
            .unwrap()
        else {
            return Vec::new();
        };
        Machine::<Tally>::downcast(machine.as_ref())
            .and_then(|m| m.snapshot())
            .map(|d| d.values.clone())
            .unwrap_or_default()
    }
}
