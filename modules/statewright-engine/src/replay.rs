//! Rebuilds an entity from its signal log.

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{info, warn};

use statewright_common::{EntityKey, Error, Result};
use statewright_store::{read_log, Storage};

use crate::behaviour::{BehaviourRegistry, EntityStateMachine};

/// A logged event the behaviour rejected during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub sequence_number: i64,
    pub event_type: String,
    pub state: Option<String>,
}

#[derive(Debug)]
pub struct ReplayReport {
    pub machine: Arc<dyn EntityStateMachine>,
    /// Logged events the behaviour accepted.
    pub events_applied: usize,
    pub inconsistencies: Vec<Inconsistency>,
}

#[derive(Clone)]
pub struct Replayer {
    storage: Arc<dyn Storage>,
    registry: Arc<BehaviourRegistry>,
    page_size: usize,
    strict: bool,
}

impl Replayer {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<BehaviourRegistry>,
        page_size: usize,
        strict: bool,
    ) -> Self {
        Self {
            storage,
            registry,
            page_size,
            strict,
        }
    }

    /// Start from a fresh machine, apply the log oldest first with emission
    /// suppressed, then write the result back as the entity's snapshot.
    pub async fn replay(&self, key: &EntityKey) -> Result<ReplayReport> {
        let behaviour = self.registry.get(&key.entity_type)?;
        let mut machine = behaviour.create(&key.id);
        let mut events_applied = 0;
        let mut inconsistencies = Vec::new();

        let mut log = read_log(self.storage.as_ref(), key, self.page_size);
        while let Some(entry) = log.try_next().await? {
            let applied = machine.apply_event(&entry.event, true, entry.applied_at)?;
            if applied.machine.transition_occurred() {
                events_applied += 1;
            } else {
                let state = machine.state();
                if self.strict {
                    return Err(Error::ReplayInconsistency {
                        key: key.clone(),
                        sequence_number: entry.sequence_number,
                        event_type: entry.event.event_type,
                        state,
                    });
                }
                warn!(
                    key = %key,
                    seq = entry.sequence_number,
                    event_type = %entry.event.event_type,
                    state = ?state,
                    "Replay rejected logged event"
                );
                inconsistencies.push(Inconsistency {
                    sequence_number: entry.sequence_number,
                    event_type: entry.event.event_type,
                    state,
                });
            }
            machine = applied.machine;
        }
        drop(log);

        if let Some(snapshot) = machine.to_snapshot()? {
            self.storage
                .write_entity(&snapshot, &machine.properties())
                .await?;
        }

        info!(
            key = %key,
            events_applied,
            inconsistencies = inconsistencies.len(),
            state = ?machine.state(),
            "Entity replayed"
        );
        Ok(ReplayReport {
            machine,
            events_applied,
            inconsistencies,
        })
    }
}
