//! The kitchen keeps a running record of which kettles have boiled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use statewright_common::EntityProperty;
use statewright_engine::{Entity, EventLike, StateMachine, TransitionContext};

pub const KITCHEN_ID: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitchenState {
    Open,
}

impl fmt::Display for KitchenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OPEN")
    }
}

impl FromStr for KitchenState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            other => Err(format!("unknown kitchen state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KitchenData {
    pub boil_count: u32,
    pub water_boiled_ml: i64,
    pub last_kettle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KitchenEvent {
    KettleBoiled { kettle: String, water_ml: i64 },
}

impl EventLike for KitchenEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::KettleBoiled { .. } => "kitchen:kettle_boiled",
        }
    }
}

pub struct Kitchen;

impl StateMachine for Kitchen {
    type State = KitchenState;
    type Snapshot = KitchenData;
    type Event = KitchenEvent;

    const ENTITY_TYPE: &'static str = "kitchen";

    fn transition(
        &self,
        _ctx: &mut TransitionContext,
        entity: Entity<'_, Self>,
        event: &KitchenEvent,
    ) -> Option<(KitchenState, KitchenData)> {
        let mut data = entity.snapshot.cloned().unwrap_or_default();
        match event {
            KitchenEvent::KettleBoiled { kettle, water_ml } => {
                data.boil_count += 1;
                data.water_boiled_ml += water_ml;
                data.last_kettle = Some(kettle.clone());
            }
        }
        Some((KitchenState::Open, data))
    }

    fn properties(
        &self,
        _id: &str,
        _state: KitchenState,
        data: &KitchenData,
    ) -> Vec<EntityProperty> {
        vec![EntityProperty::ranged(
            "kind",
            "kitchen",
            "boil_count",
            data.boil_count.into(),
        )]
    }
}
