//! Kettles and the kitchen running on the in-memory store with a logical clock.

use std::sync::Arc;

use statewright_common::config::parse_config;
use statewright_common::{EngineConfig, EntityKey, LogicalClock, PropertyPredicate, RangeQuery};
use statewright_demo::kettle::boil_time;
use statewright_demo::{
    registry, Kettle, KettleData, KettleEvent, KettleState, Kitchen, KitchenData, KITCHEN_ID,
};
use statewright_engine::{Dispatcher, EngineDeps, Machine};
use statewright_store::{EntityStore, MemoryStorage};

struct Rig {
    dispatcher: Dispatcher,
    storage: Arc<MemoryStorage>,
    clock: Arc<LogicalClock>,
}

async fn rig() -> Rig {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(LogicalClock::at_epoch());
    let deps = EngineDeps::builder()
        .storage(storage.clone())
        .registry(Arc::new(registry()))
        .clock(clock.clone())
        .build();
    let config = EngineConfig {
        timer_poll_interval_ms: 0,
        ..EngineConfig::default()
    };
    let dispatcher = Dispatcher::start(deps, config).await.unwrap();
    Rig {
        dispatcher,
        storage,
        clock,
    }
}

impl Rig {
    async fn kettle(&self, id: &str, event: KettleEvent) {
        self.dispatcher
            .signal_event("kettle", id, &event)
            .await
            .unwrap();
    }

    async fn kettle_view(&self, id: &str) -> (Option<KettleState>, KettleData) {
        let machine = self
            .dispatcher
            .entity(&EntityKey::new("kettle", id))
            .await
            .unwrap()
            .unwrap();
        let kettle = Machine::<Kettle>::downcast(machine.as_ref()).unwrap();
        (kettle.typed_state(), kettle.snapshot().cloned().unwrap_or_default())
    }

    async fn kitchen(&self) -> KitchenData {
        let Some(machine) = self
            .dispatcher
            .entity(&EntityKey::new("kitchen", KITCHEN_ID))
            .await
            .unwrap()
        else {
            return KitchenData::default();
        };
        Machine::<Kitchen>::downcast(machine.as_ref())
            .and_then(|m| m.snapshot().cloned())
            .unwrap_or_default()
    }

    async fn advance(&self, by: chrono::TimeDelta) {
        self.clock.advance(by);
        self.dispatcher.fire_due().await.unwrap();
        self.dispatcher.idle().await;
    }
}

#[tokio::test]
async fn kettle_boils_and_kitchen_counts_it() {
    let rig = rig().await;

    rig.kettle("k1", KettleEvent::Create { capacity_ml: 1000 }).await;
    rig.kettle("k1", KettleEvent::Fill { ml: 1500 }).await;
    rig.kettle("k1", KettleEvent::SwitchOn).await;
    rig.dispatcher.idle().await;

    let (state, data) = rig.kettle_view("k1").await;
    assert_eq!(state, Some(KettleState::Heating));
    assert_eq!(data.water_ml, 1000, "fill is capped at capacity");

    rig.advance(boil_time(1000) - chrono::TimeDelta::seconds(1)).await;
    assert_eq!(rig.kettle_view("k1").await.0, Some(KettleState::Heating));

    rig.advance(chrono::TimeDelta::seconds(1)).await;
    let (state, data) = rig.kettle_view("k1").await;
    assert_eq!(state, Some(KettleState::Boiled));
    assert_eq!(data.boils, 1);

    let kitchen = rig.kitchen().await;
    assert_eq!(kitchen.boil_count, 1);
    assert_eq!(kitchen.water_boiled_ml, 1000);
    assert_eq!(kitchen.last_kettle.as_deref(), Some("k1"));
}

#[tokio::test]
async fn switching_off_cancels_the_boil() {
    let rig = rig().await;

    rig.kettle("k1", KettleEvent::Create { capacity_ml: 1700 }).await;
    rig.kettle("k1", KettleEvent::Fill { ml: 500 }).await;
    rig.kettle("k1", KettleEvent::SwitchOn).await;
    rig.kettle("k1", KettleEvent::SwitchOff).await;
    rig.dispatcher.idle().await;

    rig.advance(boil_time(500) * 10).await;
    assert_eq!(rig.kettle_view("k1").await.0, Some(KettleState::Idle));
    assert_eq!(rig.kitchen().await.boil_count, 0);
}

#[tokio::test]
async fn empty_kettle_refuses_to_switch_on() {
    let rig = rig().await;

    rig.kettle("k1", KettleEvent::Create { capacity_ml: 1700 }).await;
    rig.kettle("k1", KettleEvent::SwitchOn).await;
    rig.dispatcher.idle().await;

    assert_eq!(rig.kettle_view("k1").await.0, Some(KettleState::Idle));
    assert!(rig
        .dispatcher
        .scheduler()
        .pending()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn boiled_kettles_are_findable_by_water_level() {
    let rig = rig().await;

    for (id, ml) in [("a", 300), ("b", 900), ("c", 600)] {
        rig.kettle(id, KettleEvent::Create { capacity_ml: 1700 }).await;
        rig.kettle(id, KettleEvent::Fill { ml }).await;
        rig.kettle(id, KettleEvent::SwitchOn).await;
    }
    rig.dispatcher.idle().await;
    rig.advance(boil_time(900)).await;

    let boiled = rig
        .storage
        .query_by_property_any("kettle", &[PropertyPredicate::new("state", "BOILED")])
        .await
        .unwrap();
    assert_eq!(boiled.len(), 3);

    let at_least_half_full = rig
        .storage
        .query_by_range(
            "kettle",
            &RangeQuery::new("state", "BOILED", "water_ml").lower(500, true),
        )
        .await
        .unwrap();
    assert_eq!(at_least_half_full, vec!["c".to_string(), "b".to_string()]);

    assert_eq!(rig.kitchen().await.boil_count, 3);
    assert_eq!(rig.kitchen().await.water_boiled_ml, 1800);
}

#[test]
fn shipped_config_parses() {
    let config = parse_config(include_str!("../config/statewright.toml")).unwrap();
    assert_eq!(config.engine.max_workers, 8);
    assert_eq!(config.engine.lane_batch_size, 16);
    assert!(config.engine.timer_poll_interval().is_some());
    assert!(config.database.run_migrations);
}
