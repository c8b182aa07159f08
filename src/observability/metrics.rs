use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub matches_proposed_total: IntCounterVec,
    pub match_transitions_total: IntCounterVec,
    pub batch_matching_seconds: Histogram,
    pub model_training_runs_total: IntCounterVec,
    pub model_version: IntGauge,
    pub training_examples: IntGauge,
    pub carrier_utilization: GaugeVec,
    pub side_effect_failures_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let matches_proposed_total = IntCounterVec::new(
            Opts::new("matches_proposed_total", "Matches offered to carriers by origin"),
            &["origin"],
        )
        .expect("valid matches_proposed_total metric");

        let match_transitions_total = IntCounterVec::new(
            Opts::new("match_transitions_total", "Match state transitions by target status"),
            &["status"],
        )
        .expect("valid match_transitions_total metric");

        let batch_matching_seconds = Histogram::with_opts(HistogramOpts::new(
            "batch_matching_seconds",
            "Duration of a batch matching run in seconds",
        ))
        .expect("valid batch_matching_seconds metric");

        let model_training_runs_total = IntCounterVec::new(
            Opts::new("model_training_runs_total", "Scoring model training runs by outcome"),
            &["outcome"],
        )
        .expect("valid model_training_runs_total metric");

        let model_version = IntGauge::new("model_version", "Version of the live scoring model")
            .expect("valid model_version metric");

        let training_examples =
            IntGauge::new("training_examples", "Labelled outcomes held for training")
                .expect("valid training_examples metric");

        let carrier_utilization = GaugeVec::new(
            Opts::new("carrier_utilization", "Carrier utilization ratio [0..1]"),
            &["carrier_id"],
        )
        .expect("valid carrier_utilization metric");

        let side_effect_failures_total = IntCounterVec::new(
            Opts::new(
                "side_effect_failures_total",
                "Collaborator calls that failed, timed out or were dropped",
            ),
            &["kind"],
        )
        .expect("valid side_effect_failures_total metric");

        registry
            .register(Box::new(matches_proposed_total.clone()))
            .expect("register matches_proposed_total");
        registry
            .register(Box::new(match_transitions_total.clone()))
            .expect("register match_transitions_total");
        registry
            .register(Box::new(batch_matching_seconds.clone()))
            .expect("register batch_matching_seconds");
        registry
            .register(Box::new(model_training_runs_total.clone()))
            .expect("register model_training_runs_total");
        registry
            .register(Box::new(model_version.clone()))
            .expect("register model_version");
        registry
            .register(Box::new(training_examples.clone()))
            .expect("register training_examples");
        registry
            .register(Box::new(carrier_utilization.clone()))
            .expect("register carrier_utilization");
        registry
            .register(Box::new(side_effect_failures_total.clone()))
            .expect("register side_effect_failures_total");

        Self {
            registry,
            matches_proposed_total,
            match_transitions_total,
            batch_matching_seconds,
            model_training_runs_total,
            model_version,
            training_examples,
            carrier_utilization,
            side_effect_failures_total,
        }
    }

    pub fn observe_utilization(&self, carrier_id: &str, utilization: f64) {
        self.carrier_utilization
            .with_label_values(&[carrier_id])
            .set(utilization);
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
