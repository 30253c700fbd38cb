//! Routes signals to per-entity lanes and applies them.
//!
//! Every entity key gets a lane: an in-memory mailbox ordered by sequence
//! number plus the entity's cached machine. A lane runs on at most one task at
//! a time, so transitions for one entity never overlap, while lanes for
//! different entities share a bounded worker pool. The durable queue stays the
//! source of truth. A storage failure stalls the lane with the failed signal
//! still at its head; later signals for that entity park behind it until
//! [`Dispatcher::recover`] resumes the lane.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use statewright_common::{
    Clock, EncodedEvent, EngineConfig, EntityKey, Error, NumberedSignal, Result, Signal,
    SystemClock,
};
use statewright_store::{Storage, TransitionCommit};

use crate::behaviour::{Behaviour, BehaviourRegistry, EntityStateMachine, EventLike};
use crate::context::Outbound;
use crate::replay::{ReplayReport, Replayer};
use crate::scheduler::Scheduler;

/// Everything the dispatcher needs from the outside.
#[derive(Clone, TypedBuilder)]
pub struct EngineDeps {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<BehaviourRegistry>,
    #[builder(default = Arc::new(SystemClock))]
    pub clock: Arc<dyn Clock>,
}

/// Published once per processed signal.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The signal was applied. `machine.transition_occurred()` tells whether
    /// the event was accepted.
    Applied {
        sequence_number: i64,
        event_type: String,
        machine: Arc<dyn EntityStateMachine>,
    },
    Failed {
        signal: NumberedSignal,
        error: String,
    },
}

struct Queued {
    signal: NumberedSignal,
    /// Held until the signal is processed when it came from [`Dispatcher::signal`].
    _permit: Option<OwnedSemaphorePermit>,
}

type ReplayReply = oneshot::Sender<Result<ReplayReport>>;

#[derive(Default)]
struct Lane {
    pending: BTreeMap<i64, Queued>,
    replays: VecDeque<ReplayReply>,
    machine: Option<Arc<dyn EntityStateMachine>>,
    current: Option<i64>,
    running: bool,
    /// Set after a retryable failure. Pending signals wait, uncounted by
    /// `idle()`, until `recover()` resumes the lane.
    stalled: bool,
}

enum Work {
    Signal(Queued),
    Replay(ReplayReply),
    Idle,
}

struct Inner {
    storage: Arc<dyn Storage>,
    registry: Arc<BehaviourRegistry>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    replayer: Replayer,
    config: EngineConfig,
    lanes: Mutex<HashMap<EntityKey, Lane>>,
    workers: Arc<Semaphore>,
    backpressure: Arc<Semaphore>,
    in_flight: watch::Sender<usize>,
    outcomes: broadcast::Sender<DispatchOutcome>,
    accepting: AtomicBool,
    timer_gate: tokio::sync::Mutex<()>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Build the dispatcher, re-drive whatever is still queued from a previous
    /// run and start the timer and recovery tasks.
    pub async fn start(deps: EngineDeps, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (in_flight, _) = watch::channel(0usize);
        let (outcomes, _) = broadcast::channel(config.subscriber_capacity);
        let (stop, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            scheduler: Scheduler::new(deps.storage.clone(), deps.clock.clone()),
            replayer: Replayer::new(
                deps.storage.clone(),
                deps.registry.clone(),
                config.replay_page_size,
                config.replay_strict,
            ),
            storage: deps.storage,
            registry: deps.registry,
            clock: deps.clock,
            lanes: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            backpressure: Arc::new(Semaphore::new(config.max_pending_signals)),
            in_flight,
            outcomes,
            accepting: AtomicBool::new(true),
            timer_gate: tokio::sync::Mutex::new(()),
            stop,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let recovered = inner.recover().await?;

        let mut tasks = Vec::new();
        if let Some(every) = inner.config.timer_poll_interval() {
            tasks.push(spawn_periodic(&inner, every, "timer", |inner| async move {
                inner.fire_due().await.map(|_| ())
            }));
        }
        if let Some(every) = inner.config.recovery_interval() {
            tasks.push(spawn_periodic(&inner, every, "recovery", |inner| async move {
                inner.recover().await.map(|_| ())
            }));
        }
        *lock(&inner.tasks) = tasks;

        info!(
            max_workers = inner.config.max_workers,
            entity_types = ?inner.registry.entity_types(),
            recovered,
            "Dispatcher started"
        );
        Ok(Self { inner })
    }

    /// Durably queue `event` for an entity. Returns its sequence number once
    /// queued; processing continues in the background. Waits while
    /// `max_pending_signals` externally submitted signals are unprocessed.
    pub async fn signal(&self, entity_type: &str, id: &str, event: EncodedEvent) -> Result<i64> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        self.inner.registry.get(entity_type)?;

        let permit = self
            .inner
            .backpressure
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let signal = Signal::new(EntityKey::new(entity_type, id), event);
        let sequence_number = self.inner.storage.offer(&signal).await?;
        debug!(
            seq = sequence_number,
            key = %signal.key,
            event_type = %signal.event.event_type,
            "Signal accepted"
        );

        self.inner.enqueue(
            NumberedSignal {
                sequence_number,
                signal,
            },
            Some(permit),
        );
        Ok(sequence_number)
    }

    /// [`signal`](Self::signal) with a typed event, encoded by the registry's serializer.
    pub async fn signal_event<E: EventLike>(
        &self,
        entity_type: &str,
        id: &str,
        event: &E,
    ) -> Result<i64> {
        let encoded = self.inner.registry.encode_event(event)?;
        self.signal(entity_type, id, encoded).await
    }

    /// Promote delayed signals that are due by the clock and route them.
    pub async fn fire_due(&self) -> Result<usize> {
        self.inner.fire_due().await
    }

    /// Route every durably queued signal that is not already in a lane.
    pub async fn recover(&self) -> Result<usize> {
        self.inner.recover().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Resolves once every routed signal has been processed.
    pub async fn idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        // the sender lives in `inner`, so this only errs if it is dropped
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Current persisted machine for `key`, if the entity exists.
    pub async fn entity(&self, key: &EntityKey) -> Result<Option<Arc<dyn EntityStateMachine>>> {
        let behaviour = self.inner.registry.get(&key.entity_type)?;
        match self.inner.storage.read_snapshot(key).await? {
            Some(snapshot) => Ok(Some(behaviour.restore(&snapshot)?)),
            None => Ok(None),
        }
    }

    /// Rebuild `key` from its log. Runs inside the entity's lane, after any
    /// signal it is currently applying.
    pub async fn replay(&self, key: &EntityKey) -> Result<ReplayReport> {
        self.inner.registry.get(&key.entity_type)?;
        let (tx, rx) = oneshot::channel();
        self.inner.push_replay(key.clone(), tx);
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn registry(&self) -> &Arc<BehaviourRegistry> {
        &self.inner.registry
    }

    /// Stop accepting signals, stop the background tasks and wait for routed
    /// work to drain. Anything still durably queued is picked up on next start.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let _ = self.inner.stop.send(true);

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.idle().await;
        self.inner.workers.close();
        info!("Dispatcher stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_periodic<F, Fut>(
    inner: &Arc<Inner>,
    every: Duration,
    name: &'static str,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let inner = inner.clone();
    let mut stop = inner.stop.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tick(inner.clone()).await {
                        warn!(task = name, error = %e, "Periodic task failed");
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!(task = name, "Periodic task stopped");
    })
}

impl Inner {
    fn lanes(&self) -> MutexGuard<'_, HashMap<EntityKey, Lane>> {
        lock(&self.lanes)
    }

    fn publish(&self, outcome: DispatchOutcome) {
        // no subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    /// Put a queued signal into its lane, starting the lane if it is idle.
    /// Signals already pending or being applied in the lane are ignored.
    fn enqueue(self: &Arc<Self>, signal: NumberedSignal, permit: Option<OwnedSemaphorePermit>) {
        let key = signal.key().clone();
        let seq = signal.sequence_number;
        let start = {
            let mut lanes = self.lanes();
            let lane = lanes.entry(key.clone()).or_default();
            if lane.current == Some(seq) || lane.pending.contains_key(&seq) {
                return;
            }
            lane.pending.insert(
                seq,
                Queued {
                    signal,
                    _permit: permit,
                },
            );
            if lane.stalled {
                debug!(seq, key = %key, "Lane stalled, signal parked");
                return;
            }
            self.in_flight.send_modify(|n| *n += 1);
            !std::mem::replace(&mut lane.running, true)
        };
        if start {
            tokio::spawn(self.clone().run_lane(key));
        }
    }

    fn push_replay(self: &Arc<Self>, key: EntityKey, reply: ReplayReply) {
        let start = {
            let mut lanes = self.lanes();
            let lane = lanes.entry(key.clone()).or_default();
            lane.replays.push_back(reply);
            !std::mem::replace(&mut lane.running, true)
        };
        if start {
            tokio::spawn(self.clone().run_lane(key));
        }
    }

    async fn fire_due(self: &Arc<Self>) -> Result<usize> {
        let _gate = self.timer_gate.lock().await;
        let promoted = self.scheduler.due().await?;
        for fired in &promoted {
            debug!(
                delayed_seq = fired.delayed.sequence_number,
                seq = fired.queued.sequence_number,
                key = %fired.queued.key(),
                due = %fired.delayed.due_time,
                "Delayed signal fired"
            );
            self.enqueue(fired.queued.clone(), None);
        }
        Ok(promoted.len())
    }

    async fn recover(self: &Arc<Self>) -> Result<usize> {
        let ready = self.storage.peek_ready().await?;
        let count = ready.len();
        for signal in ready {
            self.enqueue(signal, None);
        }
        if count > 0 {
            debug!(count, "Queued signals routed");
        }
        self.resume_stalled();
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Lane execution
    // -----------------------------------------------------------------------

    async fn run_lane(self: Arc<Self>, key: EntityKey) {
        loop {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                self.abandon_lane(&key);
                return;
            };
            for _ in 0..self.config.lane_batch_size {
                match self.next_work(&key) {
                    Work::Signal(queued) => {
                        if !self.process(&key, queued).await {
                            return;
                        }
                    }
                    Work::Replay(reply) => {
                        let result = self.replay_in_lane(&key).await;
                        let _ = reply.send(result);
                    }
                    Work::Idle => return,
                }
            }
            drop(permit);
            tokio::task::yield_now().await;
        }
    }

    fn next_work(&self, key: &EntityKey) -> Work {
        let mut lanes = self.lanes();
        let lane_count = lanes.len();
        let Some(lane) = lanes.get_mut(key) else {
            return Work::Idle;
        };
        if let Some(reply) = lane.replays.pop_front() {
            return Work::Replay(reply);
        }
        if lane.stalled {
            lane.running = false;
            return Work::Idle;
        }
        if let Some((seq, queued)) = lane.pending.pop_first() {
            lane.current = Some(seq);
            return Work::Signal(queued);
        }
        lane.running = false;
        if lane_count > self.config.lane_cache_capacity {
            lanes.remove(key);
        }
        Work::Idle
    }

    /// Workers are closed after shutdown: drop whatever the lane still holds.
    /// Pending replies resolve as `ShuttingDown`; signals stay durably queued.
    fn abandon_lane(&self, key: &EntityKey) {
        let mut lanes = self.lanes();
        if let Some(lane) = lanes.remove(key) {
            if !lane.stalled {
                let dropped = lane.pending.len();
                self.in_flight.send_modify(|n| *n -= dropped);
            }
            debug!(key = %key, "Lane abandoned after shutdown");
        }
    }

    /// Returns false when the lane stalled and must stop running.
    async fn process(self: &Arc<Self>, key: &EntityKey, queued: Queued) -> bool {
        let signal = queued.signal.clone();
        let seq = signal.sequence_number;

        match self.apply(key, &signal).await {
            Ok(machine) => self.publish(DispatchOutcome::Applied {
                sequence_number: seq,
                event_type: signal.event().event_type.clone(),
                machine,
            }),
            Err(Error::SignalNotQueued(_)) => {
                debug!(seq, key = %key, "Signal already applied, skipping");
                self.forget_machine(key);
            }
            Err(e) if e.is_retryable() => {
                error!(seq, key = %key, error = %e, "Signal failed, left queued for recovery");
                self.stall(key, queued);
                self.publish(DispatchOutcome::Failed {
                    signal,
                    error: e.to_string(),
                });
                return false;
            }
            Err(e) => {
                error!(seq, key = %key, error = %e, "Signal can never apply, dead-lettering");
                let written = self
                    .storage
                    .dead_letter(&signal, &e.to_string(), self.clock.now())
                    .await;
                self.publish(DispatchOutcome::Failed {
                    signal,
                    error: e.to_string(),
                });
                if let Err(store_err) = written {
                    error!(seq, error = %store_err, "Dead-letter write failed");
                    self.stall(key, queued);
                    return false;
                }
            }
        }

        {
            let mut lanes = self.lanes();
            if let Some(lane) = lanes.get_mut(key) {
                lane.current = None;
            }
            self.in_flight.send_modify(|n| *n -= 1);
        }
        drop(queued);
        true
    }

    /// Apply one signal and commit the outcome.
    async fn apply(
        self: &Arc<Self>,
        key: &EntityKey,
        signal: &NumberedSignal,
    ) -> Result<Arc<dyn EntityStateMachine>> {
        let behaviour = self.registry.get(&key.entity_type)?;
        let machine = self.load(key, behaviour.as_ref()).await?;
        let now = self.clock.now();
        let applied = machine.apply_event(signal.event(), false, now)?;
        let next = applied.machine;
        let seq = signal.sequence_number;

        if !next.transition_occurred() {
            if !self.storage.remove(seq).await? {
                return Err(Error::SignalNotQueued(seq));
            }
            debug!(
                seq,
                key = %key,
                state = ?next.state(),
                event_type = %signal.event().event_type,
                "Event rejected in current state"
            );
            self.cache_machine(key, next.clone());
            return Ok(next);
        }

        let snapshot = next.to_snapshot()?.ok_or_else(|| {
            Error::serialization(&key.entity_type, "transition produced no snapshot")
        })?;

        let mut commit = TransitionCommit {
            signal: signal.clone(),
            snapshot,
            properties: next.properties(),
            applied_at: now,
            cancellations: Vec::new(),
            immediate: Vec::new(),
            delayed: Vec::new(),
        };
        for outbound in applied.outbound {
            match outbound {
                Outbound::Signal(s) => commit.immediate.push(s),
                Outbound::Delayed { signal, delay } => commit.delayed.push((signal, now + delay)),
                Outbound::Cancel { target } => commit.cancellations.push(target),
            }
        }

        let receipt = self.storage.commit_transition(&commit).await?;
        info!(
            seq,
            key = %key,
            from = ?next.previous_state(),
            to = ?next.state(),
            queued = receipt.queued.len(),
            scheduled = receipt.scheduled.len(),
            cancelled = receipt.cancelled,
            "Transition committed"
        );

        self.cache_machine(key, next.clone());
        for queued in receipt.queued {
            self.enqueue(queued, None);
        }
        Ok(next)
    }

    /// Cache → snapshot → log replay → fresh machine.
    async fn load(
        &self,
        key: &EntityKey,
        behaviour: &dyn Behaviour,
    ) -> Result<Arc<dyn EntityStateMachine>> {
        let cached = self.lanes().get(key).and_then(|l| l.machine.clone());
        if let Some(machine) = cached {
            return Ok(machine);
        }

        let machine = if let Some(snapshot) = self.storage.read_snapshot(key).await? {
            behaviour.restore(&snapshot)?
        } else if self.storage.has_log(key).await? {
            warn!(key = %key, "Snapshot missing but log present, replaying");
            self.replayer.replay(key).await?.machine
        } else {
            behaviour.create(&key.id)
        };
        self.cache_machine(key, machine.clone());
        Ok(machine)
    }

    async fn replay_in_lane(&self, key: &EntityKey) -> Result<ReplayReport> {
        let report = self.replayer.replay(key).await;
        match &report {
            Ok(report) => self.cache_machine(key, report.machine.clone()),
            Err(_) => self.forget_machine(key),
        }
        report
    }

    fn cache_machine(&self, key: &EntityKey, machine: Arc<dyn EntityStateMachine>) {
        if let Some(lane) = self.lanes().get_mut(key) {
            lane.machine = Some(machine);
        }
    }

    fn forget_machine(&self, key: &EntityKey) {
        if let Some(lane) = self.lanes().get_mut(key) {
            lane.machine = None;
        }
    }

    /// Put the failed signal back at the head of its lane and stop the lane.
    /// Nothing with a higher sequence number applies until it commits. The
    /// cached machine may be stale, so it is dropped too.
    fn stall(&self, key: &EntityKey, queued: Queued) {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(key) else {
            self.in_flight.send_modify(|n| *n -= 1);
            return;
        };
        let seq = queued.signal.sequence_number;
        lane.pending.insert(seq, queued);
        lane.current = None;
        lane.machine = None;
        lane.running = false;
        lane.stalled = true;
        // the failed signal was counted as current, the rest as pending
        let parked = lane.pending.len();
        self.in_flight.send_modify(|n| *n -= parked);
        warn!(key = %key, seq, parked, "Lane stalled");
    }

    fn resume_stalled(self: &Arc<Self>) {
        let resumed: Vec<EntityKey> = {
            let mut lanes = self.lanes();
            lanes
                .iter_mut()
                .filter(|(_, lane)| lane.stalled)
                .filter_map(|(key, lane)| {
                    lane.stalled = false;
                    let parked = lane.pending.len();
                    self.in_flight.send_modify(|n| *n += parked);
                    info!(key = %key, parked, "Stalled lane resumed");
                    let idle = !std::mem::replace(&mut lane.running, true);
                    idle.then(|| key.clone())
                })
                .collect()
        };
        for key in resumed {
            tokio::spawn(self.clone().run_lane(key));
        }
    }
}
