use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::engine::effects::SideEffect;
use crate::engine::model::ScoringModel;
use crate::engine::training::{EntityLookup, TrainingRequest};
use crate::models::carrier::Carrier;
use crate::models::matching::{Match, MatchEvent};
use crate::models::package::Package;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct QueueSizes {
    pub training: usize,
    pub effects: usize,
    pub events: usize,
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self {
            training: 64,
            effects: 1024,
            events: 1024,
        }
    }
}

/// Receiving ends for the background workers.
pub struct WorkerChannels {
    pub training_rx: mpsc::Receiver<TrainingRequest>,
    pub effects_rx: mpsc::Receiver<SideEffect>,
}

/// Registry of packages, carriers and matches shared by every operation.
///
/// Lock order when more than one entry is held: matches, then carriers, then
/// packages. Never hold an entry of a map while taking another entry of the
/// same map.
pub struct AppState {
    pub packages: DashMap<Uuid, Package>,
    pub carriers: DashMap<Uuid, Carrier>,
    pub matches: DashMap<Uuid, Match>,
    pub model: ScoringModel,
    pub settings: EngineSettings,
    pub training_tx: mpsc::Sender<TrainingRequest>,
    pub effects_tx: mpsc::Sender<SideEffect>,
    pub match_events_tx: broadcast::Sender<MatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(settings: EngineSettings, queues: QueueSizes) -> (Self, WorkerChannels) {
        let (training_tx, training_rx) = mpsc::channel(queues.training.max(1));
        let (effects_tx, effects_rx) = mpsc::channel(queues.effects.max(1));
        let (match_events_tx, _unused_rx) = broadcast::channel(queues.events.max(1));

        (
            Self {
                packages: DashMap::new(),
                carriers: DashMap::new(),
                matches: DashMap::new(),
                model: ScoringModel::new(settings.max_training_examples),
                settings,
                training_tx,
                effects_tx,
                match_events_tx,
                metrics: Metrics::new(),
            },
            WorkerChannels {
                training_rx,
                effects_rx,
            },
        )
    }

    /// Match transitions from now on. Lagging subscribers skip what they missed.
    pub fn subscribe_events(&self) -> impl Stream<Item = MatchEvent> + Send + 'static {
        BroadcastStream::new(self.match_events_tx.subscribe()).filter_map(|result| result.ok())
    }
}

impl EntityLookup for AppState {
    fn package(&self, id: Uuid) -> Option<Package> {
        self.packages.get(&id).map(|entry| entry.value().clone())
    }

    fn carrier(&self, id: Uuid) -> Option<Carrier> {
        self.carriers.get(&id).map(|entry| entry.value().clone())
    }
}
