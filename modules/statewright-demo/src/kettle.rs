//! A kettle: fill it, switch it on, and it boils after a delay proportional to
//! how much water it holds. Boiling notifies the kitchen.

use std::fmt;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use statewright_common::EntityProperty;
use statewright_engine::{Entity, EventLike, StateMachine, TransitionContext};

use crate::kitchen::{KitchenEvent, KITCHEN_ID};

/// Heating time per 100 ml.
const SECONDS_PER_100_ML: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KettleState {
    Idle,
    Heating,
    Boiled,
}

impl fmt::Display for KettleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Heating => "HEATING",
            Self::Boiled => "BOILED",
        })
    }
}

impl FromStr for KettleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "HEATING" => Ok(Self::Heating),
            "BOILED" => Ok(Self::Boiled),
            other => Err(format!("unknown kettle state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KettleData {
    pub capacity_ml: i64,
    pub water_ml: i64,
    pub boils: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KettleEvent {
    Create { capacity_ml: i64 },
    Fill { ml: i64 },
    SwitchOn,
    SwitchOff,
    Boiled,
    Pour { ml: i64 },
}

impl EventLike for KettleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Create { .. } => "kettle:create",
            Self::Fill { .. } => "kettle:fill",
            Self::SwitchOn => "kettle:switch_on",
            Self::SwitchOff => "kettle:switch_off",
            Self::Boiled => "kettle:boiled",
            Self::Pour { .. } => "kettle:pour",
        }
    }
}

pub fn boil_time(water_ml: i64) -> TimeDelta {
    TimeDelta::seconds((water_ml * SECONDS_PER_100_ML / 100).max(1))
}

pub struct Kettle;

impl StateMachine for Kettle {
    type State = KettleState;
    type Snapshot = KettleData;
    type Event = KettleEvent;

    const ENTITY_TYPE: &'static str = "kettle";

    fn transition(
        &self,
        ctx: &mut TransitionContext,
        entity: Entity<'_, Self>,
        event: &KettleEvent,
    ) -> Option<(KettleState, KettleData)> {
        use KettleEvent as E;
        use KettleState as S;

        let Some(state) = entity.state else {
            return match event {
                E::Create { capacity_ml } if *capacity_ml > 0 => Some((
                    S::Idle,
                    KettleData {
                        capacity_ml: *capacity_ml,
                        ..KettleData::default()
                    },
                )),
                _ => None,
            };
        };
        let mut data = entity.snapshot.cloned().unwrap_or_default();

        match (state, event) {
            (S::Idle | S::Boiled, E::Fill { ml }) if *ml > 0 => {
                data.water_ml = (data.water_ml + ml).min(data.capacity_ml);
                Some((S::Idle, data))
            }
            (S::Idle, E::SwitchOn) if data.water_ml > 0 => {
                ctx.signal_to_self_after(&E::Boiled, boil_time(data.water_ml));
                Some((S::Heating, data))
            }
            (S::Heating, E::SwitchOff) => {
                ctx.cancel_signals_to_self();
                Some((S::Idle, data))
            }
            (S::Heating, E::Boiled) => {
                data.boils += 1;
                ctx.signal(
                    "kitchen",
                    KITCHEN_ID,
                    &KitchenEvent::KettleBoiled {
                        kettle: entity.id.to_string(),
                        water_ml: data.water_ml,
                    },
                );
                Some((S::Boiled, data))
            }
            (S::Boiled, E::Pour { ml }) if *ml > 0 => {
                data.water_ml = (data.water_ml - ml).max(0);
                Some((S::Boiled, data))
            }
            _ => None,
        }
    }

    fn properties(&self, _id: &str, state: KettleState, data: &KettleData) -> Vec<EntityProperty> {
        vec![
            EntityProperty::new("state", state.to_string()),
            EntityProperty::ranged("state", state.to_string(), "water_ml", data.water_ml),
        ]
    }
}
