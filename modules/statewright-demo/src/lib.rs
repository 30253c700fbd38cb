//! Sample behaviours wiring the engine end to end: kettles that boil on a
//! timer and a kitchen that counts them.

pub mod kettle;
pub mod kitchen;

use std::sync::Arc;

use anyhow::{Context, Result};
use statewright_common::{AppConfig, DatabaseConfig};
use statewright_engine::BehaviourRegistry;
use statewright_store::{MemoryStorage, PgStorage, Storage};
use tracing::info;

pub use kettle::{Kettle, KettleData, KettleEvent, KettleState};
pub use kitchen::{Kitchen, KitchenData, KitchenEvent, KitchenState, KITCHEN_ID};

pub fn registry() -> BehaviourRegistry {
    let mut registry = BehaviourRegistry::default();
    registry.register(Kettle).register(Kitchen);
    registry
}

/// Postgres when `DATABASE_URL` is set, otherwise process memory.
pub async fn open_storage(app: &AppConfig, database: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    match &app.database_url {
        Some(url) => {
            let storage = PgStorage::connect(url, database)
                .await
                .context("Failed to connect to Postgres")?;
            info!(max_connections = database.max_connections, "Using Postgres storage");
            Ok(Arc::new(storage))
        }
        None => {
            info!("DATABASE_URL not set, using in-memory storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}
