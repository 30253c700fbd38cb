//! Durable per-entity state machine engine.
//!
//! Signals are durably queued, routed to one lane per entity and applied in
//! sequence order by the entity type's [`Behaviour`]. Each accepted transition
//! commits the new snapshot, its property index rows, a log entry and any
//! outbound signals atomically, then is published to subscribers.
//!
//! Consumers describe an entity type by implementing [`StateMachine`] and
//! registering it in a [`BehaviourRegistry`].

pub mod behaviour;
pub mod context;
pub mod dispatcher;
pub mod replay;
pub mod scheduler;

pub use behaviour::{
    Applied, Behaviour, BehaviourRegistry, Entity, EntityStateMachine, EventLike, Machine,
    StateMachine, TypedBehaviour,
};
pub use context::{Outbound, TransitionContext};
pub use dispatcher::{DispatchOutcome, Dispatcher, EngineDeps};
pub use replay::{Inconsistency, ReplayReport, Replayer};
pub use scheduler::Scheduler;
