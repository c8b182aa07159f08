use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::matching::{Match, MatchEvent};
use crate::state::AppState;

/// Work handed to external collaborators after a transition has been applied.
#[derive(Debug, Clone)]
pub enum SideEffect {
    Persist(Match),
    Notify(MatchEvent),
    Payout(Match),
    Emissions {
        package_id: Uuid,
        carrier_id: Uuid,
        detour_km: f64,
    },
}

impl SideEffect {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffect::Persist(_) => "persist",
            SideEffect::Notify(_) => "notify",
            SideEffect::Payout(_) => "payout",
            SideEffect::Emissions { .. } => "emissions",
        }
    }
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn save_match(&self, m: &Match) -> Result<(), AppError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &MatchEvent) -> Result<(), AppError>;
}

#[async_trait]
pub trait PayoutProcessor: Send + Sync {
    async fn release_payout(&self, m: &Match) -> Result<(), AppError>;
}

#[async_trait]
pub trait EmissionsEstimator: Send + Sync {
    async fn record_detour(
        &self,
        package_id: Uuid,
        carrier_id: Uuid,
        detour_km: f64,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MatchStore>,
    pub notifier: Arc<dyn Notifier>,
    pub payouts: Arc<dyn PayoutProcessor>,
    pub emissions: Arc<dyn EmissionsEstimator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let logging = Arc::new(LoggingCollaborator);
        Self {
            store: logging.clone(),
            notifier: logging.clone(),
            payouts: logging.clone(),
            emissions: logging,
        }
    }
}

/// Stand-in for every collaborator: records the call in the log and succeeds.
pub struct LoggingCollaborator;

#[async_trait]
impl MatchStore for LoggingCollaborator {
    async fn save_match(&self, m: &Match) -> Result<(), AppError> {
        debug!(match_id = %m.id, status = m.status.as_str(), "match persisted");
        Ok(())
    }
}

#[async_trait]
impl Notifier for LoggingCollaborator {
    async fn notify(&self, event: &MatchEvent) -> Result<(), AppError> {
        debug!(
            match_id = %event.match_id,
            to = event.to.as_str(),
            "match notification sent"
        );
        Ok(())
    }
}

#[async_trait]
impl PayoutProcessor for LoggingCollaborator {
    async fn release_payout(&self, m: &Match) -> Result<(), AppError> {
        debug!(match_id = %m.id, payout = m.payout, "payout released");
        Ok(())
    }
}

#[async_trait]
impl EmissionsEstimator for LoggingCollaborator {
    async fn record_detour(
        &self,
        package_id: Uuid,
        carrier_id: Uuid,
        detour_km: f64,
    ) -> Result<(), AppError> {
        debug!(%package_id, %carrier_id, detour_km, "detour reported for emissions");
        Ok(())
    }
}

/// Queues a side effect without waiting. A full or closed queue drops it.
pub fn dispatch(state: &AppState, effect: SideEffect) {
    match state.effects_tx.try_send(effect) {
        Ok(()) => {}
        Err(TrySendError::Full(effect)) => {
            state
                .metrics
                .side_effect_failures_total
                .with_label_values(&[effect.kind()])
                .inc();
            warn!(kind = effect.kind(), "side effect queue full; dropping");
        }
        Err(TrySendError::Closed(effect)) => {
            debug!(kind = effect.kind(), "side effect queue closed; dropping");
        }
    }
}

pub async fn run_side_effects(
    state: Arc<AppState>,
    collaborators: Collaborators,
    mut effects_rx: mpsc::Receiver<SideEffect>,
) {
    info!("side effect dispatcher started");
    let timeout = Duration::from_millis(state.settings.collaborator_timeout_ms);

    while let Some(effect) = effects_rx.recv().await {
        let kind = effect.kind();

        match tokio::time::timeout(timeout, apply(&collaborators, &effect)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                state
                    .metrics
                    .side_effect_failures_total
                    .with_label_values(&[kind])
                    .inc();
                warn!(kind, error = %err, "collaborator call failed");
            }
            Err(_) => {
                state
                    .metrics
                    .side_effect_failures_total
                    .with_label_values(&[kind])
                    .inc();
                warn!(kind, timeout_ms = timeout.as_millis() as u64, "collaborator call timed out");
            }
        }
    }

    warn!("side effect dispatcher stopped: queue channel closed");
}

async fn apply(collaborators: &Collaborators, effect: &SideEffect) -> Result<(), AppError> {
    match effect {
        SideEffect::Persist(m) => collaborators.store.save_match(m).await,
        SideEffect::Notify(event) => collaborators.notifier.notify(event).await,
        SideEffect::Payout(m) => collaborators.payouts.release_payout(m).await,
        SideEffect::Emissions {
            package_id,
            carrier_id,
            detour_km,
        } => {
            collaborators
                .emissions
                .record_detour(*package_id, *carrier_id, *detour_km)
                .await
        }
    }
}
