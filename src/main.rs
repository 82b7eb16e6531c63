mod clock;
mod config;
mod mqtt;
mod outage_log;
mod plan;
mod publisher;
mod standby;
mod worker;

use crate::clock::CommandClock;
use crate::config::Config;
use crate::mqtt::{Broker, RumqttBroker};
use crate::outage_log::OutageLog;
use crate::plan::PlanStore;
use crate::publisher::Publisher;
use crate::standby::StandbyService;
use crate::worker::Worker;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

fn init_tracing(configured_level: &str) -> Result<()> {
    let level = match configured_level.to_ascii_lowercase().as_str() {
        level @ ("debug" | "info" | "warn" | "error") => level.to_string(),
        _ => "info".to_string(),
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{level},standby_controller={level}").into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.logging_level)?;

    let broker: Arc<dyn Broker> = Arc::new(RumqttBroker::new(&config));
    let plan_store = Arc::new(PlanStore::new(&config.backup_file));
    let clock = Arc::new(CommandClock::new());
    let outage_log = Arc::new(OutageLog::open(&config.outage_log_file)?);
    let publisher = Arc::new(Publisher::new(&config, broker.clone()));

    let standby = Arc::new(StandbyService::new(
        config.clone(),
        broker,
        plan_store,
        clock,
        publisher,
        outage_log.clone(),
    ));
    let worker = Worker::new(standby);

    worker.start().await?;
    tracing::info!(
        site=%config.site_name,
        serial=%config.serial_number,
        "standby controller running"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = sigterm.recv() => {
            tracing::info!("termination signal received");
        }
    }

    worker.stop().await;
    outage_log.close();
    Ok(())
}
