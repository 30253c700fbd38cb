//! In-memory backend. Every operation holds one mutex for its whole duration,
//! which makes each call (and each transition commit) trivially atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use statewright_common::{
    DeadLetter, DelayedSignal, EntityKey, EntityProperty, EntitySnapshot, Error, NumberedSignal,
    PromotedSignal, PropertyPredicate, RangeQuery, Result, Signal, SignalLogEntry,
};

use crate::traits::{
    CommitReceipt, DelayedSignalStore, EntityStore, SignalLog, SignalQueue, TransitionCommit,
    TransitionStore,
};

#[derive(Default)]
struct Tables {
    next_seq: i64,
    queue: BTreeMap<i64, Signal>,
    delayed: BTreeMap<i64, DelayedSignal>,
    entities: HashMap<EntityKey, EntitySnapshot>,
    properties: HashMap<EntityKey, Vec<EntityProperty>>,
    log: HashMap<EntityKey, Vec<SignalLogEntry>>,
    dead_letters: Vec<DeadLetter>,
    #[cfg(feature = "test-utils")]
    failing_commits: usize,
}

impl Tables {
    fn allocate_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn enqueue(&mut self, signal: Signal) -> NumberedSignal {
        let sequence_number = self.allocate_seq();
        self.queue.insert(sequence_number, signal.clone());
        NumberedSignal {
            sequence_number,
            signal,
        }
    }

    fn schedule(
        &mut self,
        signal: Signal,
        from: EntityKey,
        due_time: DateTime<Utc>,
    ) -> DelayedSignal {
        let delayed = DelayedSignal {
            sequence_number: self.allocate_seq(),
            from,
            signal,
            due_time,
        };
        self.delayed.insert(delayed.sequence_number, delayed.clone());
        delayed
    }

    fn cancel(&mut self, from: &EntityKey, target: &EntityKey) -> u64 {
        let before = self.delayed.len();
        self.delayed
            .retain(|_, d| !(&d.from == from && &d.signal.key == target));
        (before - self.delayed.len()) as u64
    }

    fn ids_matching(&self, entity_type: &str, predicate: &PropertyPredicate) -> BTreeSet<String> {
        self.properties
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .filter(|(_, rows)| {
                rows.iter().any(|p| {
                    p.range.is_none() && p.name == predicate.name && p.value == predicate.value
                })
            })
            .map(|(key, _)| key.id.clone())
            .collect()
    }
}

/// Storage backed by process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full log across all entities (for test assertions).
    pub fn log_len(&self) -> usize {
        self.tables().log.values().map(Vec::len).sum()
    }
}

#[cfg(feature = "test-utils")]
impl MemoryStorage {
    /// Make the next `n` transition commits fail with a storage error.
    pub fn fail_next_commits(&self, n: usize) {
        self.tables().failing_commits = n;
    }
}

#[async_trait]
impl SignalQueue for MemoryStorage {
    async fn offer(&self, signal: &Signal) -> Result<i64> {
        Ok(self.tables().enqueue(signal.clone()).sequence_number)
    }

    async fn peek_ready(&self) -> Result<Vec<NumberedSignal>> {
        Ok(self
            .tables()
            .queue
            .iter()
            .map(|(seq, signal)| NumberedSignal {
                sequence_number: *seq,
                signal: signal.clone(),
            })
            .collect())
    }

    async fn remove(&self, sequence_number: i64) -> Result<bool> {
        Ok(self.tables().queue.remove(&sequence_number).is_some())
    }
}

#[async_trait]
impl SignalLog for MemoryStorage {
    async fn append(&self, entry: &SignalLogEntry) -> Result<()> {
        self.tables()
            .log
            .entry(entry.key.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn read_log_page(
        &self,
        key: &EntityKey,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SignalLogEntry>> {
        let tables = self.tables();
        let Some(entries) = tables.log.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|e| after.map_or(true, |a| e.sequence_number > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn has_log(&self, key: &EntityKey) -> Result<bool> {
        Ok(self.tables().log.get(key).is_some_and(|e| !e.is_empty()))
    }
}

#[async_trait]
impl DelayedSignalStore for MemoryStorage {
    async fn schedule(
        &self,
        signal: &Signal,
        from: &EntityKey,
        due_time: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .tables()
            .schedule(signal.clone(), from.clone(), due_time)
            .sequence_number)
    }

    async fn cancel(&self, from: &EntityKey, target: &EntityKey) -> Result<u64> {
        Ok(self.tables().cancel(from, target))
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<PromotedSignal>> {
        let mut tables = self.tables();
        let mut due: Vec<DelayedSignal> = tables
            .delayed
            .values()
            .filter(|d| d.due_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|d| (d.due_time, d.sequence_number));

        let mut promoted = Vec::with_capacity(due.len());
        for delayed in due {
            tables.delayed.remove(&delayed.sequence_number);
            let queued = tables.enqueue(delayed.signal.clone());
            promoted.push(PromotedSignal { delayed, queued });
        }
        Ok(promoted)
    }

    async fn pending_delayed(&self) -> Result<Vec<DelayedSignal>> {
        let mut pending: Vec<DelayedSignal> = self.tables().delayed.values().cloned().collect();
        pending.sort_by_key(|d| (d.due_time, d.sequence_number));
        Ok(pending)
    }
}

#[async_trait]
impl EntityStore for MemoryStorage {
    async fn read_snapshot(&self, key: &EntityKey) -> Result<Option<EntitySnapshot>> {
        Ok(self.tables().entities.get(key).cloned())
    }

    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        self.tables()
            .entities
            .insert(snapshot.key.clone(), snapshot.clone());
        Ok(())
    }

    async fn write_properties(&self, key: &EntityKey, properties: &[EntityProperty]) -> Result<()> {
        self.tables()
            .properties
            .insert(key.clone(), properties.to_vec());
        Ok(())
    }

    async fn write_entity(
        &self,
        snapshot: &EntitySnapshot,
        properties: &[EntityProperty],
    ) -> Result<()> {
        let mut tables = self.tables();
        tables
            .entities
            .insert(snapshot.key.clone(), snapshot.clone());
        tables
            .properties
            .insert(snapshot.key.clone(), properties.to_vec());
        Ok(())
    }

    async fn query_by_property_any(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>> {
        let tables = self.tables();
        Ok(predicates
            .iter()
            .flat_map(|p| tables.ids_matching(entity_type, p))
            .collect())
    }

    async fn query_by_property_all(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>> {
        let tables = self.tables();
        let mut sets = predicates.iter().map(|p| tables.ids_matching(entity_type, p));
        let Some(first) = sets.next() else {
            return Ok(BTreeSet::new());
        };
        Ok(sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect()))
    }

    async fn query_by_range(&self, entity_type: &str, query: &RangeQuery) -> Result<Vec<String>> {
        let tables = self.tables();
        let mut hits: Vec<(i64, String)> = tables
            .properties
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .flat_map(|(key, rows)| {
                rows.iter().filter_map(move |p| {
                    let range = p.range.as_ref()?;
                    (p.name == query.name
                        && p.value == query.value
                        && range.name == query.range_name
                        && query.contains(range.value))
                    .then(|| (range.value, key.id.clone()))
                })
            })
            .collect();
        hits.sort();
        Ok(hits
            .into_iter()
            .take(query.limit)
            .map(|(_, id)| id)
            .collect())
    }

    async fn list_all(&self, entity_type: &str) -> Result<Vec<EntitySnapshot>> {
        let mut all: Vec<EntitySnapshot> = self
            .tables()
            .entities
            .values()
            .filter(|s| s.key.entity_type == entity_type)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        Ok(all)
    }
}

#[async_trait]
impl TransitionStore for MemoryStorage {
    async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitReceipt> {
        let mut tables = self.tables();

        #[cfg(feature = "test-utils")]
        if tables.failing_commits > 0 {
            tables.failing_commits -= 1;
            return Err(Error::storage("injected commit failure"));
        }

        let seq = commit.signal.sequence_number;
        if tables.queue.remove(&seq).is_none() {
            return Err(Error::SignalNotQueued(seq));
        }

        let key = commit.snapshot.key.clone();
        tables.entities.insert(key.clone(), commit.snapshot.clone());
        tables.properties.insert(key.clone(), commit.properties.clone());
        tables
            .log
            .entry(key.clone())
            .or_default()
            .push(commit.log_entry());

        let mut receipt = CommitReceipt::default();
        for target in &commit.cancellations {
            receipt.cancelled += tables.cancel(&key, target);
        }
        for signal in &commit.immediate {
            receipt.queued.push(tables.enqueue(signal.clone()));
        }
        for (signal, due_time) in &commit.delayed {
            receipt
                .scheduled
                .push(tables.schedule(signal.clone(), key.clone(), *due_time));
        }
        Ok(receipt)
    }

    async fn dead_letter(
        &self,
        signal: &NumberedSignal,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables();
        tables.queue.remove(&signal.sequence_number);
        tables.dead_letters.push(DeadLetter {
            sequence_number: signal.sequence_number,
            signal: signal.signal.clone(),
            error: error.to_string(),
            failed_at: at,
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.tables().dead_letters.clone())
    }
}
