//! Shared vocabulary for the statewright engine: the entity/signal data model,
//! the error taxonomy, the injected clock, byte serializers and configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod serializer;
pub mod types;

pub use clock::{Clock, LogicalClock, SystemClock};
pub use config::{AppConfig, DatabaseConfig, EngineConfig, FileConfig};
pub use error::{Error, Result};
pub use serializer::{decode, encode, JsonSerializer, Serializer};
pub use types::*;
