//! Delayed signals on top of the durable scheduler table.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use statewright_common::{Clock, DelayedSignal, EntityKey, PromotedSignal, Result, Signal};
use statewright_store::Storage;

#[derive(Clone)]
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub async fn schedule(
        &self,
        signal: &Signal,
        from: &EntityKey,
        due_time: DateTime<Utc>,
    ) -> Result<i64> {
        let seq = self.storage.schedule(signal, from, due_time).await?;
        debug!(seq, from = %from, target = %signal.key, due = %due_time, "Signal scheduled");
        Ok(seq)
    }

    pub async fn schedule_after(
        &self,
        signal: &Signal,
        from: &EntityKey,
        delay: TimeDelta,
    ) -> Result<i64> {
        self.schedule(signal, from, self.clock.now() + delay).await
    }

    /// Drop every pending signal from `from` to `target`. Returns how many.
    pub async fn cancel(&self, from: &EntityKey, target: &EntityKey) -> Result<u64> {
        let cancelled = self.storage.cancel(from, target).await?;
        if cancelled > 0 {
            debug!(from = %from, target = %target, cancelled, "Delayed signals cancelled");
        }
        Ok(cancelled)
    }

    /// Move everything due by the clock's current time into the signal queue.
    pub async fn due(&self) -> Result<Vec<PromotedSignal>> {
        self.due_at(self.clock.now()).await
    }

    pub async fn due_at(&self, now: DateTime<Utc>) -> Result<Vec<PromotedSignal>> {
        self.storage.promote_due(now).await
    }

    pub async fn pending(&self) -> Result<Vec<DelayedSignal>> {
        self.storage.pending_delayed().await
    }
}
