//! The capability a behaviour is handed while it decides a transition.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use statewright_common::{encode, EncodedEvent, EntityKey, Error, Result, Serializer, Signal};

use crate::behaviour::EventLike;

/// Intent recorded by a behaviour. Nothing happens until the transition commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Signal(Signal),
    Delayed { signal: Signal, delay: TimeDelta },
    /// Drop every pending delayed signal from this entity to `target`.
    Cancel { target: EntityKey },
}

/// Passed to every transition. Records outbound signals and cancellations,
/// and exposes the entity's key, the application time and whether the event is
/// being replayed.
///
/// While replaying every call is dropped: the signals were already emitted
/// when the event was first applied.
pub struct TransitionContext {
    key: EntityKey,
    now: DateTime<Utc>,
    replaying: bool,
    serializer: Arc<dyn Serializer>,
    outbound: Vec<Outbound>,
    error: Option<Error>,
}

impl TransitionContext {
    pub fn new(
        key: EntityKey,
        now: DateTime<Utc>,
        replaying: bool,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            key,
            now,
            replaying,
            serializer,
            outbound: Vec::new(),
            error: None,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Time the event is applied at. During replay, the time it was first applied.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn signal_to_self<E: EventLike>(&mut self, event: &E) {
        let target = self.key.clone();
        self.push_signal(target, event, None);
    }

    pub fn signal_to_self_after<E: EventLike>(&mut self, event: &E, delay: TimeDelta) {
        let target = self.key.clone();
        self.push_signal(target, event, Some(delay));
    }

    pub fn signal<E: EventLike>(&mut self, entity_type: &str, id: &str, event: &E) {
        self.push_signal(EntityKey::new(entity_type, id), event, None);
    }

    pub fn signal_after<E: EventLike>(
        &mut self,
        entity_type: &str,
        id: &str,
        event: &E,
        delay: TimeDelta,
    ) {
        self.push_signal(EntityKey::new(entity_type, id), event, Some(delay));
    }

    pub fn cancel_signals_to_self(&mut self) {
        let target = self.key.clone();
        self.push(Outbound::Cancel { target });
    }

    pub fn cancel_signals_to(&mut self, entity_type: &str, id: &str) {
        self.push(Outbound::Cancel {
            target: EntityKey::new(entity_type, id),
        });
    }

    fn push(&mut self, outbound: Outbound) {
        if !self.replaying {
            self.outbound.push(outbound);
        }
    }

    fn push_signal<E: EventLike>(
        &mut self,
        target: EntityKey,
        event: &E,
        delay: Option<TimeDelta>,
    ) {
        if self.replaying || self.error.is_some() {
            return;
        }
        let event_type = event.event_type();
        let bytes = match encode(self.serializer.as_ref(), event_type, event) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.error = Some(e);
                return;
            }
        };
        let signal = Signal::new(target, EncodedEvent::new(event_type, bytes));
        self.outbound.push(match delay {
            None => Outbound::Signal(signal),
            Some(delay) => Outbound::Delayed { signal, delay },
        });
    }

    /// Everything recorded, in call order. Fails with the first event that
    /// could not be encoded.
    pub fn into_outbound(self) -> Result<Vec<Outbound>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.outbound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use statewright_common::JsonSerializer;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl EventLike for Ping {
        fn event_type(&self) -> &'static str {
            "Ping"
        }
    }

    fn context(replaying: bool) -> TransitionContext {
        TransitionContext::new(
            EntityKey::new("bell", "1"),
            DateTime::<Utc>::default(),
            replaying,
            Arc::new(JsonSerializer),
        )
    }

    #[test]
    fn records_intent_in_call_order() {
        let mut ctx = context(false);
        ctx.signal_to_self_after(&Ping, TimeDelta::seconds(5));
        ctx.signal("bell", "2", &Ping);
        ctx.cancel_signals_to("bell", "3");

        let outbound = ctx.into_outbound().unwrap();
        assert_eq!(outbound.len(), 3);
        match &outbound[0] {
            Outbound::Delayed { signal, delay } => {
                assert_eq!(signal.key, EntityKey::new("bell", "1"));
                assert_eq!(signal.event.event_type, "Ping");
                assert_eq!(*delay, TimeDelta::seconds(5));
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert!(matches!(&outbound[1], Outbound::Signal(s) if s.key.id == "2"));
        assert!(matches!(&outbound[2], Outbound::Cancel { target } if target.id == "3"));
    }

    #[test]
    fn replaying_suppresses_everything() {
        let mut ctx = context(true);
        assert!(ctx.is_replaying());
        ctx.signal_to_self(&Ping);
        ctx.cancel_signals_to_self();
        assert!(ctx.into_outbound().unwrap().is_empty());
    }
}
