use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use statewright_common::config::load_config;
use statewright_common::{AppConfig, EntityKey, PropertyPredicate};
use statewright_demo::{open_storage, registry, Kettle, KettleEvent, Kitchen, KITCHEN_ID};
use statewright_engine::{DispatchOutcome, Dispatcher, EngineDeps, Machine};

#[derive(Parser)]
#[command(name = "statewright-demo", about = "Boil kettles through the statewright engine")]
struct Cli {
    /// Path to config TOML file
    #[arg(long, default_value = "./config/statewright.toml")]
    config: PathBuf,

    /// Number of kettles to boil
    #[arg(long, default_value_t = 3)]
    kettles: usize,

    /// Water per kettle
    #[arg(long, default_value_t = 500)]
    water_ml: i64,

    /// Give up if the kettles have not all boiled after this long
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let app = AppConfig::from_env();
    let config_path = app
        .config_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or(cli.config);
    let file_config = load_config(&config_path).with_context(|| {
        format!(
            "Config file not loaded: {}. Create one or specify --config <path>",
            config_path.display()
        )
    })?;
    info!(config = %config_path.display(), "Config file loaded");

    let storage = open_storage(&app, &file_config.database).await?;
    let deps = EngineDeps::builder()
        .storage(storage.clone())
        .registry(Arc::new(registry()))
        .build();
    let dispatcher = Dispatcher::start(deps, file_config.engine.clone())
        .await
        .context("Failed to start dispatcher")?;

    let mut outcomes = dispatcher.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match outcomes.recv().await {
                Ok(DispatchOutcome::Applied { machine, event_type, .. }) => {
                    if machine.transition_occurred() {
                        info!(
                            entity = %machine.key(),
                            event_type = %event_type,
                            from = ?machine.previous_state(),
                            to = ?machine.state(),
                            "Transition"
                        );
                    } else {
                        info!(
                            entity = %machine.key(),
                            event_type = %event_type,
                            state = ?machine.state(),
                            "Event ignored"
                        );
                    }
                }
                Ok(DispatchOutcome::Failed { signal, error }) => {
                    warn!(
                        seq = signal.sequence_number,
                        entity = %signal.key(),
                        error = %error,
                        "Signal failed"
                    );
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Outcome reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let kitchen = EntityKey::new("kitchen", KITCHEN_ID);
    let baseline = boil_count(&dispatcher, &kitchen).await?;

    for n in 0..cli.kettles {
        let id = format!("kettle-{n}");
        dispatcher
            .signal_event("kettle", &id, &KettleEvent::Create { capacity_ml: 1700 })
            .await?;
        dispatcher
            .signal_event("kettle", &id, &KettleEvent::Fill { ml: cli.water_ml })
            .await?;
        dispatcher
            .signal_event("kettle", &id, &KettleEvent::SwitchOn)
            .await?;
    }
    info!(kettles = cli.kettles, water_ml = cli.water_ml, "Kettles switched on");

    let target = baseline + cli.kettles as u32;
    let waited = tokio::time::timeout(Duration::from_secs(cli.timeout_secs), async {
        loop {
            if boil_count(&dispatcher, &kitchen).await? >= target {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    match waited {
        Ok(result) => result?,
        Err(_) => warn!(timeout_secs = cli.timeout_secs, "Not every kettle boiled in time"),
    }

    let boiled = storage
        .query_by_property_any("kettle", &[PropertyPredicate::new("state", "BOILED")])
        .await?;
    info!(boiled = boiled.len(), ids = ?boiled, "Boiled kettles");

    for id in boiled.iter().take(1) {
        if let Some(machine) = dispatcher.entity(&EntityKey::new("kettle", id.as_str())).await? {
            if let Some(kettle) = Machine::<Kettle>::downcast(machine.as_ref()) {
                info!(id = %id, snapshot = ?kettle.snapshot(), "Sample kettle");
            }
        }
    }

    dispatcher.shutdown().await;
    reporter.abort();
    Ok(())
}

async fn boil_count(dispatcher: &Dispatcher, kitchen: &EntityKey) -> Result<u32> {
    let Some(machine) = dispatcher.entity(kitchen).await? else {
        return Ok(0);
    };
    Ok(Machine::<Kitchen>::downcast(machine.as_ref())
        .and_then(|m| m.snapshot())
        .map(|data| data.boil_count)
        .unwrap_or(0))
}
