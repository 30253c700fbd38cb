//! Rebuilding entities from the signal log.

mod common;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use statewright_common::{EngineConfig, EntityKey, Error, SignalLogEntry};
use statewright_engine::Replayer;
use statewright_store::{read_log, EntityStore, MemoryStorage, SignalLog};

use common::{cook_time, harness, harness_on, registry, test_config, MicrowaveEvent, MicrowaveState};

fn microwave(id: &str) -> EntityKey {
    EntityKey::new("microwave", id)
}

async fn copy_log(from: &MemoryStorage, to: &MemoryStorage, key: &EntityKey) -> usize {
    let entries: Vec<SignalLogEntry> = read_log(from, key, 2).try_collect().await.unwrap();
    for entry in &entries {
        to.append(entry).await.unwrap();
    }
    entries.len()
}

fn log_entry(seq: i64, id: &str, event: &MicrowaveEvent) -> SignalLogEntry {
    SignalLogEntry {
        sequence_number: seq,
        key: microwave(id),
        event: registry().encode_event(event).unwrap(),
        applied_at: DateTime::<Utc>::default() + TimeDelta::seconds(seq),
    }
}

#[tokio::test]
async fn replay_reproduces_live_state_without_re_emitting() {
    let h = harness().await;
    h.microwave("m1", MicrowaveEvent::Create { power: 700 }).await;
    h.microwave("m1", MicrowaveEvent::ButtonPressed).await;
    h.dispatcher.idle().await;
    h.advance(cook_time()).await;
    h.microwave("m1", MicrowaveEvent::DoorOpened).await;
    h.dispatcher.idle().await;

    let live = h
        .storage
        .read_snapshot(&microwave("m1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.state_tag.as_deref(), Some("READY"));

    let report = h.dispatcher.replay(&microwave("m1")).await.unwrap();
    assert_eq!(report.events_applied, 4);
    assert!(report.inconsistencies.is_empty());
    assert_eq!(report.machine.to_snapshot().unwrap(), Some(live.clone()));

    // written back unchanged, and no timer or tally signal was re-sent
    let after = h.storage.read_snapshot(&microwave("m1")).await.unwrap();
    assert_eq!(after, Some(live));
    assert!(h.dispatcher.scheduler().pending().await.unwrap().is_empty());
    h.dispatcher.idle().await;
    assert_eq!(h.tally_values("kitchen").await, vec![1]);
}

#[tokio::test]
async fn missing_snapshot_is_rebuilt_before_the_next_signal() {
    let first = harness().await;
    first.microwave("m1", MicrowaveEvent::Create { power: 500 }).await;
    first.microwave("m1", MicrowaveEvent::ButtonPressed).await;
    first.dispatcher.idle().await;
    first.advance(cook_time()).await;

    // a fresh store holding only the log
    let storage = Arc::new(MemoryStorage::new());
    assert_eq!(copy_log(&first.storage, &storage, &microwave("m1")).await, 3);
    assert!(storage.read_snapshot(&microwave("m1")).await.unwrap().is_none());

    let second = harness_on(storage, test_config()).await;
    second.microwave("m1", MicrowaveEvent::DoorOpened).await;
    second.dispatcher.idle().await;

    assert_eq!(second.microwave_state("m1").await, Some(MicrowaveState::Ready));
    let data = second.microwave_data("m1").await.unwrap();
    assert_eq!(data.power, 500);
    assert_eq!(data.cook_count, 1);
}

#[tokio::test]
async fn rejected_log_entries_are_reported() {
    let storage = MemoryStorage::new();
    for entry in [
        log_entry(1, "m9", &MicrowaveEvent::Create { power: 100 }),
        log_entry(2, "m9", &MicrowaveEvent::DoorClosed),
        log_entry(3, "m9", &MicrowaveEvent::ButtonPressed),
    ] {
        storage.append(&entry).await.unwrap();
    }
    let storage = Arc::new(storage);

    let lenient = Replayer::new(storage.clone(), registry(), 16, false);
    let report = lenient.replay(&microwave("m9")).await.unwrap();
    assert_eq!(report.events_applied, 2);
    assert_eq!(report.inconsistencies.len(), 1);
    assert_eq!(report.inconsistencies[0].sequence_number, 2);
    assert_eq!(report.inconsistencies[0].event_type, "DoorClosed");
    assert_eq!(report.inconsistencies[0].state.as_deref(), Some("READY"));
    assert_eq!(report.machine.state().as_deref(), Some("COOKING"));

    let strict = Replayer::new(storage, registry(), 16, true);
    let err = strict.replay(&microwave("m9")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ReplayInconsistency { sequence_number: 2, .. }
    ));
}

#[tokio::test]
async fn strict_dispatcher_replay_surfaces_the_error() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .append(&log_entry(1, "m9", &MicrowaveEvent::DoorOpened))
        .await
        .unwrap();

    let config = EngineConfig {
        replay_strict: true,
        ..test_config()
    };
    let h = harness_on(storage, config).await;
    let err = h.dispatcher.replay(&microwave("m9")).await.unwrap_err();
    assert!(matches!(err, Error::ReplayInconsistency { .. }));
}
