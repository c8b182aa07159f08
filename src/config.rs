use std::env;
use std::path::PathBuf;

use chrono::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub training_queue_size: usize,
    pub effect_queue_size: usize,
    pub snapshot_path: Option<PathBuf>,
    pub batch_interval_secs: u64,
    pub engine: EngineSettings,
}

/// Tunables read by the matching engine itself.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub min_match_score: f64,
    pub batch_min_score: f64,
    pub offer_ttl: Duration,
    pub manual_offer_ttl: Duration,
    /// Upper bound for any offer lifetime, including per-request overrides.
    pub max_offer_ttl: Duration,
    pub training_epochs: usize,
    pub learning_rate: f64,
    pub max_training_examples: usize,
    pub platform_fee_rate: f64,
    pub collaborator_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_match_score: 0.6,
            batch_min_score: 0.0,
            offer_ttl: Duration::minutes(60),
            manual_offer_ttl: Duration::hours(24),
            max_offer_ttl: Duration::days(30),
            training_epochs: 200,
            learning_rate: 0.1,
            max_training_examples: 10_000,
            platform_fee_rate: 0.15,
            collaborator_timeout_ms: 2_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            min_match_score: parse_or_default("MIN_MATCH_SCORE", defaults.min_match_score)?,
            batch_min_score: parse_or_default("BATCH_MIN_SCORE", defaults.batch_min_score)?,
            offer_ttl: ttl_or_default("OFFER_TTL_MINUTES", defaults.offer_ttl)?,
            manual_offer_ttl: ttl_or_default("MANUAL_OFFER_TTL_MINUTES", defaults.manual_offer_ttl)?,
            max_offer_ttl: ttl_or_default("MAX_OFFER_TTL_MINUTES", defaults.max_offer_ttl)?,
            training_epochs: parse_or_default("TRAINING_EPOCHS", defaults.training_epochs)?,
            learning_rate: parse_or_default("LEARNING_RATE", defaults.learning_rate)?,
            max_training_examples: parse_or_default(
                "MAX_TRAINING_EXAMPLES",
                defaults.max_training_examples,
            )?,
            platform_fee_rate: parse_or_default("PLATFORM_FEE_RATE", defaults.platform_fee_rate)?,
            collaborator_timeout_ms: parse_or_default(
                "COLLABORATOR_TIMEOUT_MS",
                defaults.collaborator_timeout_ms,
            )?,
        };

        if !(0.0..=1.0).contains(&engine.min_match_score) {
            return Err(AppError::Internal(
                "MIN_MATCH_SCORE must be within [0, 1]".to_string(),
            ));
        }
        if engine.offer_ttl <= Duration::zero() || engine.manual_offer_ttl <= Duration::zero() {
            return Err(AppError::Internal("offer ttl must be positive".to_string()));
        }
        if engine.offer_ttl.max(engine.manual_offer_ttl) > engine.max_offer_ttl {
            return Err(AppError::Internal(
                "offer ttl cannot exceed MAX_OFFER_TTL_MINUTES".to_string(),
            ));
        }

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact/json"
                )));
            }
        };

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            training_queue_size: parse_or_default("TRAINING_QUEUE_SIZE", 64)?,
            effect_queue_size: parse_or_default("EFFECT_QUEUE_SIZE", 1024)?,
            snapshot_path: env::var("SNAPSHOT_PATH").ok().map(PathBuf::from),
            batch_interval_secs: parse_or_default("BATCH_INTERVAL_SECS", 300)?,
            engine,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn ttl_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    let minutes = parse_or_default(key, default.num_minutes())?;

    Duration::try_minutes(minutes)
        .ok_or_else(|| AppError::Internal(format!("invalid {key}: {minutes} minutes is out of range")))
}
