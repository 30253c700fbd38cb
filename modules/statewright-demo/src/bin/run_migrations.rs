//! Runs pending SQLx migrations against the database.
//!
//! Migrations are embedded at compile time, so no migration files are needed
//! at runtime.

use anyhow::{Context, Result};
use statewright_common::DatabaseConfig;
use statewright_store::PgStorage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    println!("Running database migrations...");

    let config = DatabaseConfig {
        max_connections: 2,
        run_migrations: true,
    };
    PgStorage::connect(&database_url, &config).await?;

    println!("Migrations completed successfully.");

    Ok(())
}
