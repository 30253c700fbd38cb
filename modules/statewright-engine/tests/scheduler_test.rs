//! Delayed signal timing against a logical clock.

use std::sync::Arc;

use chrono::TimeDelta;
use statewright_common::{Clock, EncodedEvent, EntityKey, LogicalClock, Signal};
use statewright_engine::Scheduler;
use statewright_store::{MemoryStorage, SignalQueue};

fn setup() -> (Scheduler, Arc<MemoryStorage>, Arc<LogicalClock>) {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(LogicalClock::at_epoch());
    let scheduler = Scheduler::new(storage.clone(), clock.clone());
    (scheduler, storage, clock)
}

fn ding(id: &str) -> Signal {
    Signal::new(
        EntityKey::new("bell", id),
        EncodedEvent::new("Ding", b"{}".to_vec()),
    )
}

#[tokio::test]
async fn fires_once_and_not_before_due() {
    let (scheduler, storage, clock) = setup();
    let from = EntityKey::new("bell", "1");

    scheduler
        .schedule_after(&ding("1"), &from, TimeDelta::seconds(10))
        .await
        .unwrap();
    let pending = scheduler.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].due_time, clock.now() + TimeDelta::seconds(10));

    clock.advance(TimeDelta::seconds(9));
    assert!(scheduler.due().await.unwrap().is_empty());
    assert!(storage.peek_ready().await.unwrap().is_empty());

    clock.advance(TimeDelta::seconds(1));
    let fired = scheduler.due().await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].queued.signal, ding("1"));

    clock.advance(TimeDelta::seconds(100));
    assert!(scheduler.due().await.unwrap().is_empty());
    assert_eq!(storage.peek_ready().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_signal_never_fires() {
    let (scheduler, storage, clock) = setup();
    let from = EntityKey::new("bell", "1");

    scheduler
        .schedule_after(&ding("1"), &from, TimeDelta::seconds(10))
        .await
        .unwrap();
    scheduler
        .schedule_after(&ding("2"), &from, TimeDelta::seconds(10))
        .await
        .unwrap();

    assert_eq!(
        scheduler
            .cancel(&from, &EntityKey::new("bell", "1"))
            .await
            .unwrap(),
        1
    );

    clock.advance(TimeDelta::seconds(60));
    let fired = scheduler.due().await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].queued.key().id, "2");
    assert_eq!(storage.peek_ready().await.unwrap().len(), 1);
}

#[tokio::test]
async fn simultaneous_due_times_fire_in_schedule_order() {
    let (scheduler, _storage, clock) = setup();
    let due = clock.now() + TimeDelta::seconds(5);
    let from = EntityKey::new("bell", "origin");

    for id in ["c", "a", "b"] {
        scheduler.schedule(&ding(id), &from, due).await.unwrap();
    }

    let fired = scheduler.due_at(due).await.unwrap();
    let ids: Vec<&str> = fired.iter().map(|f| f.queued.key().id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}
