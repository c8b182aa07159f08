use std::sync::Arc;
use std::time::Duration;

use parcel_match::config::{Config, LogFormat};
use parcel_match::engine::assignment::run_batch_scheduler;
use parcel_match::engine::effects::{Collaborators, run_side_effects};
use parcel_match::engine::training::run_training_worker;
use parcel_match::error::AppError;
use parcel_match::requests::Snapshot;
use parcel_match::state::{AppState, QueueSizes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let queues = QueueSizes {
        training: config.training_queue_size,
        effects: config.effect_queue_size,
        events: config.event_buffer_size,
    };
    let (app_state, channels) = AppState::new(config.engine.clone(), queues);
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_training_worker(
        shared_state.clone(),
        channels.training_rx,
    ));
    tokio::spawn(run_side_effects(
        shared_state.clone(),
        Collaborators::default(),
        channels.effects_rx,
    ));

    if let Some(path) = &config.snapshot_path {
        let (packages, carriers) = Snapshot::load(path)?.register(&shared_state)?;
        tracing::info!(path = %path.display(), packages, carriers, "snapshot loaded");
    }

    let every = Duration::from_secs(config.batch_interval_secs.max(1));
    tracing::info!(interval_secs = every.as_secs(), "matching service started");

    tokio::select! {
        _ = run_batch_scheduler(shared_state.clone(), every) => {},
        _ = shutdown_signal() => {},
    }

    match shared_state.metrics.encode() {
        Ok(body) => tracing::debug!(metrics = %body, "final metrics"),
        Err(err) => tracing::warn!(error = %err, "failed to encode metrics"),
    }
    tracing::info!("matching service stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
