//! The boundary between the engine and per-entity-type logic.
//!
//! Authors implement the typed [`StateMachine`] trait. [`TypedBehaviour`]
//! erases it into a [`Behaviour`], which the dispatcher looks up by entity type
//! in a [`BehaviourRegistry`] and drives through [`EntityStateMachine`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use statewright_common::{
    decode, encode, EncodedEvent, EntityKey, EntityProperty, EntitySnapshot, Error,
    JsonSerializer, Result, Serializer,
};

use crate::context::{Outbound, TransitionContext};

/// Events carry a stable type name, stored alongside their bytes.
pub trait EventLike: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
}

/// The current entity as seen by a transition.
pub struct Entity<'a, M: StateMachine + ?Sized> {
    pub id: &'a str,
    /// `None` until a creation event has been accepted.
    pub state: Option<M::State>,
    pub snapshot: Option<&'a M::Snapshot>,
}

/// Typed per-entity-type logic.
///
/// `transition` must be pure apart from the context: given the same entity,
/// event and `ctx.now()` it returns the same result. Returning `None` rejects
/// the event in the current state.
pub trait StateMachine: Send + Sync + 'static {
    type State: Copy + Eq + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static;
    type Snapshot: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Event: EventLike;

    const ENTITY_TYPE: &'static str;

    fn transition(
        &self,
        ctx: &mut TransitionContext,
        entity: Entity<'_, Self>,
        event: &Self::Event,
    ) -> Option<(Self::State, Self::Snapshot)>;

    /// Rows for the secondary index, recomputed after every transition.
    fn properties(
        &self,
        _id: &str,
        _state: Self::State,
        _snapshot: &Self::Snapshot,
    ) -> Vec<EntityProperty> {
        Vec::new()
    }
}

/// Result of applying one event.
pub struct Applied {
    pub machine: Arc<dyn EntityStateMachine>,
    pub outbound: Vec<Outbound>,
}

/// An entity's machine with its type erased. Immutable: applying an event
/// returns a new machine.
pub trait EntityStateMachine: Send + Sync + fmt::Debug {
    fn key(&self) -> &EntityKey;

    fn state(&self) -> Option<String>;

    /// State before the event that produced this machine.
    fn previous_state(&self) -> Option<String>;

    /// Whether the event that produced this machine was accepted.
    fn transition_occurred(&self) -> bool;

    fn apply_event(
        &self,
        event: &EncodedEvent,
        replaying: bool,
        now: DateTime<Utc>,
    ) -> Result<Applied>;

    /// `None` for an entity that has never been created.
    fn to_snapshot(&self) -> Result<Option<EntitySnapshot>>;

    fn properties(&self) -> Vec<EntityProperty>;

    fn as_any(&self) -> &dyn Any;
}

/// Factory for one entity type's machines.
pub trait Behaviour: Send + Sync {
    fn entity_type(&self) -> &str;

    /// A machine with no state and no snapshot.
    fn create(&self, id: &str) -> Arc<dyn EntityStateMachine>;

    fn restore(&self, snapshot: &EntitySnapshot) -> Result<Arc<dyn EntityStateMachine>>;
}

// ---------------------------------------------------------------------------
// Typed machine
// ---------------------------------------------------------------------------

pub struct Machine<M: StateMachine> {
    behaviour: Arc<M>,
    serializer: Arc<dyn Serializer>,
    key: EntityKey,
    state: Option<M::State>,
    previous: Option<M::State>,
    snapshot: Option<M::Snapshot>,
    transitioned: bool,
}

impl<M: StateMachine> Machine<M> {
    /// Recover the typed machine behind a trait object.
    pub fn downcast(machine: &dyn EntityStateMachine) -> Option<&Self> {
        machine.as_any().downcast_ref::<Self>()
    }

    pub fn typed_state(&self) -> Option<M::State> {
        self.state
    }

    pub fn snapshot(&self) -> Option<&M::Snapshot> {
        self.snapshot.as_ref()
    }

    fn next(
        &self,
        state: Option<M::State>,
        snapshot: Option<M::Snapshot>,
        transitioned: bool,
    ) -> Self {
        Self {
            behaviour: self.behaviour.clone(),
            serializer: self.serializer.clone(),
            key: self.key.clone(),
            state,
            previous: self.state,
            snapshot,
            transitioned,
        }
    }
}

impl<M: StateMachine> fmt::Debug for Machine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("previous", &self.previous)
            .field("transitioned", &self.transitioned)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl<M: StateMachine> EntityStateMachine for Machine<M> {
    fn key(&self) -> &EntityKey {
        &self.key
    }

    fn state(&self) -> Option<String> {
        self.state.map(|s| s.to_string())
    }

    fn previous_state(&self) -> Option<String> {
        self.previous.map(|s| s.to_string())
    }

    fn transition_occurred(&self) -> bool {
        self.transitioned
    }

    fn apply_event(
        &self,
        event: &EncodedEvent,
        replaying: bool,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let typed: M::Event = decode(self.serializer.as_ref(), &event.event_type, &event.bytes)?;

        let mut ctx = TransitionContext::new(
            self.key.clone(),
            now,
            replaying,
            self.serializer.clone(),
        );
        let entity = Entity {
            id: &self.key.id,
            state: self.state,
            snapshot: self.snapshot.as_ref(),
        };

        match self.behaviour.transition(&mut ctx, entity, &typed) {
            Some((state, snapshot)) => Ok(Applied {
                machine: Arc::new(self.next(Some(state), Some(snapshot), true)),
                outbound: ctx.into_outbound()?,
            }),
            None => Ok(Applied {
                machine: Arc::new(self.next(self.state, self.snapshot.clone(), false)),
                outbound: Vec::new(),
            }),
        }
    }

    fn to_snapshot(&self) -> Result<Option<EntitySnapshot>> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(None);
        };
        Ok(Some(EntitySnapshot {
            key: self.key.clone(),
            state_tag: self.state(),
            bytes: encode(self.serializer.as_ref(), M::ENTITY_TYPE, snapshot)?,
        }))
    }

    fn properties(&self) -> Vec<EntityProperty> {
        match (self.state, &self.snapshot) {
            (Some(state), Some(snapshot)) => {
                self.behaviour.properties(&self.key.id, state, snapshot)
            }
            _ => Vec::new(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Adapter and registry
// ---------------------------------------------------------------------------

/// Erases a [`StateMachine`] into a [`Behaviour`].
pub struct TypedBehaviour<M: StateMachine> {
    machine: Arc<M>,
    serializer: Arc<dyn Serializer>,
}

impl<M: StateMachine> TypedBehaviour<M> {
    pub fn new(machine: M, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            machine: Arc::new(machine),
            serializer,
        }
    }

    fn build(
        &self,
        key: EntityKey,
        state: Option<M::State>,
        snapshot: Option<M::Snapshot>,
    ) -> Machine<M> {
        Machine {
            behaviour: self.machine.clone(),
            serializer: self.serializer.clone(),
            key,
            state,
            previous: None,
            snapshot,
            transitioned: false,
        }
    }
}

impl<M: StateMachine> Behaviour for TypedBehaviour<M> {
    fn entity_type(&self) -> &str {
        M::ENTITY_TYPE
    }

    fn create(&self, id: &str) -> Arc<dyn EntityStateMachine> {
        Arc::new(self.build(EntityKey::new(M::ENTITY_TYPE, id), None, None))
    }

    fn restore(&self, snapshot: &EntitySnapshot) -> Result<Arc<dyn EntityStateMachine>> {
        let state = snapshot
            .state_tag
            .as_deref()
            .map(|tag| {
                tag.parse::<M::State>().map_err(|_| {
                    Error::serialization(M::ENTITY_TYPE, format!("unknown state tag {tag:?}"))
                })
            })
            .transpose()?;
        let data: M::Snapshot = decode(self.serializer.as_ref(), M::ENTITY_TYPE, &snapshot.bytes)?;
        Ok(Arc::new(self.build(snapshot.key.clone(), state, Some(data))))
    }
}

/// Entity type tag → behaviour, fixed at startup.
pub struct BehaviourRegistry {
    behaviours: HashMap<String, Arc<dyn Behaviour>>,
    serializer: Arc<dyn Serializer>,
}

impl BehaviourRegistry {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            behaviours: HashMap::new(),
            serializer,
        }
    }

    pub fn register<M: StateMachine>(&mut self, machine: M) -> &mut Self {
        let behaviour = TypedBehaviour::new(machine, self.serializer.clone());
        self.register_behaviour(Arc::new(behaviour))
    }

    pub fn register_behaviour(&mut self, behaviour: Arc<dyn Behaviour>) -> &mut Self {
        self.behaviours
            .insert(behaviour.entity_type().to_string(), behaviour);
        self
    }

    pub fn get(&self, entity_type: &str) -> Result<&Arc<dyn Behaviour>> {
        self.behaviours
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn encode_event<E: EventLike>(&self, event: &E) -> Result<EncodedEvent> {
        let event_type = event.event_type();
        let bytes = encode(self.serializer.as_ref(), event_type, event)?;
        Ok(EncodedEvent::new(event_type, bytes))
    }

    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.behaviours.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for BehaviourRegistry {
    fn default() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }
}
