//! Storage contracts shared by every backend.
//!
//! Implemented by `PgStorage` (production) and `MemoryStorage` (tests, demos).
//! A backend implements all five traits and so becomes a [`Storage`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use statewright_common::{
    DeadLetter, DelayedSignal, EntityKey, EntityProperty, EntitySnapshot, Error, NumberedSignal,
    PromotedSignal, PropertyPredicate, RangeQuery, Result, Signal, SignalLogEntry,
};

/// Durable, sequence-numbered queue of signals waiting to be applied.
#[async_trait]
pub trait SignalQueue: Send + Sync {
    /// Persist the signal under a fresh sequence number.
    async fn offer(&self, signal: &Signal) -> Result<i64>;

    /// All queued signals, ascending by sequence number. Nothing is removed.
    async fn peek_ready(&self) -> Result<Vec<NumberedSignal>>;

    /// Delete a queue row. Returns whether it existed.
    async fn remove(&self, sequence_number: i64) -> Result<bool>;
}

/// Append-only record of applied signals, read back for replay.
#[async_trait]
pub trait SignalLog: Send + Sync {
    async fn append(&self, entry: &SignalLogEntry) -> Result<()>;

    /// Up to `limit` entries for `key` with a sequence number above `after`,
    /// oldest first.
    async fn read_log_page(
        &self,
        key: &EntityKey,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SignalLogEntry>>;

    async fn has_log(&self, key: &EntityKey) -> Result<bool>;
}

/// Future-dated signals, cancellable by their originator.
#[async_trait]
pub trait DelayedSignalStore: Send + Sync {
    async fn schedule(
        &self,
        signal: &Signal,
        from: &EntityKey,
        due_time: DateTime<Utc>,
    ) -> Result<i64>;

    /// Remove every pending delayed signal from `from` to `target`.
    async fn cancel(&self, from: &EntityKey, target: &EntityKey) -> Result<u64>;

    /// Atomically move every delayed signal due at `now` into the signal queue,
    /// oldest due first. Each row is promoted by exactly one caller.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<PromotedSignal>>;

    /// Still-pending delayed signals, ascending by due time.
    async fn pending_delayed(&self) -> Result<Vec<DelayedSignal>>;
}

/// Entity snapshots plus the secondary property index.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn read_snapshot(&self, key: &EntityKey) -> Result<Option<EntitySnapshot>>;

    async fn write_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()>;

    /// Replace every property row of `key` with `properties`.
    async fn write_properties(&self, key: &EntityKey, properties: &[EntityProperty]) -> Result<()>;

    /// Snapshot and properties in one transaction.
    async fn write_entity(
        &self,
        snapshot: &EntitySnapshot,
        properties: &[EntityProperty],
    ) -> Result<()>;

    /// Ids matching at least one predicate.
    async fn query_by_property_any(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>>;

    /// Ids matching every predicate.
    async fn query_by_property_all(
        &self,
        entity_type: &str,
        predicates: &[PropertyPredicate],
    ) -> Result<BTreeSet<String>>;

    async fn query_by_range(&self, _entity_type: &str, _query: &RangeQuery) -> Result<Vec<String>> {
        Err(Error::UnsupportedQuery("range search".into()))
    }

    /// Every snapshot of `entity_type`, ordered by id.
    async fn list_all(&self, entity_type: &str) -> Result<Vec<EntitySnapshot>>;
}

/// Everything one successful transition writes, committed as a unit.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// The signal being applied. Its queue row is removed by the commit.
    pub signal: NumberedSignal,
    pub snapshot: EntitySnapshot,
    pub properties: Vec<EntityProperty>,
    pub applied_at: DateTime<Utc>,
    /// Delayed signals from this entity to these targets are cancelled before
    /// any new delayed signal is scheduled.
    pub cancellations: Vec<EntityKey>,
    pub immediate: Vec<Signal>,
    pub delayed: Vec<(Signal, DateTime<Utc>)>,
}

impl TransitionCommit {
    pub fn log_entry(&self) -> SignalLogEntry {
        SignalLogEntry {
            sequence_number: self.signal.sequence_number,
            key: self.signal.key().clone(),
            event: self.signal.event().clone(),
            applied_at: self.applied_at,
        }
    }
}

/// What a committed transition added to the queues.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub queued: Vec<NumberedSignal>,
    pub scheduled: Vec<DelayedSignal>,
    pub cancelled: u64,
}

#[async_trait]
pub trait TransitionStore: Send + Sync {
    /// Snapshot upsert, property reindex, log append, outbound signals and
    /// queue removal in one transaction. Fails with `SignalNotQueued` (and
    /// writes nothing) when the originating row is already gone.
    async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitReceipt>;

    /// Move a signal that can never be applied out of the queue.
    async fn dead_letter(&self, signal: &NumberedSignal, error: &str, at: DateTime<Utc>)
        -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// A complete backend.
pub trait Storage:
    SignalQueue + SignalLog + DelayedSignalStore + EntityStore + TransitionStore
{
}

impl<T> Storage for T where
    T: SignalQueue + SignalLog + DelayedSignalStore + EntityStore + TransitionStore
{
}

/// Lazy, restartable stream over an entity's log, oldest first. Pages are
/// fetched on demand by keyset pagination on the sequence number.
pub fn read_log<'a, L>(
    log: &'a L,
    key: &'a EntityKey,
    page_size: usize,
) -> BoxStream<'a, Result<SignalLogEntry>>
where
    L: SignalLog + ?Sized,
{
    let page_size = page_size.max(1);
    stream::try_unfold(Some(None), move |cursor: Option<Option<i64>>| async move {
        let Some(after) = cursor else {
            return Ok(None);
        };
        let page = log.read_log_page(key, after, page_size).await?;
        if page.is_empty() {
            return Ok(None);
        }
        let next = if page.len() < page_size {
            None
        } else {
            page.last().map(|e| Some(e.sequence_number))
        };
        Ok::<_, Error>(Some((stream::iter(page.into_iter().map(Ok::<_, Error>)), next)))
    })
    .try_flatten()
    .boxed()
}
