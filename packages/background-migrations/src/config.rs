//! Configuration.
//!
//! [`Config`] is what a deployment reads from the environment. [`Settings`] is what the
//! engine runs with: the same tuning values plus the throttling, error-reporting and
//! instrumentation callbacks, which can only be supplied from code.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use tracing::error;
use typed_builder::TypedBuilder;

use crate::error::Error;
use crate::events::{EventSink, TracingEventSink};
use crate::models::Job;

/// Deployment environment, read from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::Configuration(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub environment: Environment,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub batch_pause_ms: i64,
    pub sub_batch_pause_ms: i64,
    pub batch_max_attempts: i32,
    pub stuck_jobs_timeout_secs: u64,
    pub run_inline: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            environment: env::var("APP_ENV")
                .unwrap_or_else(|_| "development".to_string())
                .parse()
                .context("APP_ENV must be development, test or production")?,
            batch_size: parse_var("BACKGROUND_MIGRATIONS_BATCH_SIZE", 20_000)?,
            sub_batch_size: parse_var("BACKGROUND_MIGRATIONS_SUB_BATCH_SIZE", 1_000)?,
            batch_pause_ms: parse_var("BACKGROUND_MIGRATIONS_BATCH_PAUSE_MS", 0)?,
            sub_batch_pause_ms: parse_var("BACKGROUND_MIGRATIONS_SUB_BATCH_PAUSE_MS", 100)?,
            batch_max_attempts: parse_var("BACKGROUND_MIGRATIONS_BATCH_MAX_ATTEMPTS", 5)?,
            stuck_jobs_timeout_secs: parse_var(
                "BACKGROUND_MIGRATIONS_STUCK_JOBS_TIMEOUT_SECS",
                3_600,
            )?,
            run_inline: parse_var("BACKGROUND_MIGRATIONS_RUN_INLINE", false)?,
        };

        config.settings().validate()?;
        Ok(config)
    }

    /// Engine settings with default callbacks.
    pub fn settings(&self) -> Settings {
        Settings::builder()
            .environment(self.environment)
            .batch_size(self.batch_size)
            .sub_batch_size(self.sub_batch_size)
            .batch_pause_ms(self.batch_pause_ms)
            .sub_batch_pause_ms(self.sub_batch_pause_ms)
            .batch_max_attempts(self.batch_max_attempts)
            .stuck_jobs_timeout(Duration::from_secs(self.stuck_jobs_timeout_secs))
            .run_inline(self.run_inline)
            .build()
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, value)),
        Err(_) => Ok(default),
    }
}

pub type Throttler = Arc<dyn Fn() -> bool + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error, &Job) + Send + Sync>;

/// Engine settings.
///
/// Tuning values are defaults for newly enqueued migrations; a migration keeps the values
/// it was created with, and a job keeps the values it was created with.
#[derive(Clone, TypedBuilder)]
pub struct Settings {
    #[builder(default)]
    pub environment: Environment,

    #[builder(default = 20_000)]
    pub batch_size: i64,
    #[builder(default = 1_000)]
    pub sub_batch_size: i64,
    #[builder(default = 0)]
    pub batch_pause_ms: i64,
    #[builder(default = 100)]
    pub sub_batch_pause_ms: i64,
    #[builder(default = 5)]
    pub batch_max_attempts: i32,

    /// How long a job may stay `running` without a heartbeat before it is re-dispatched.
    /// Also the length of the orchestrator's per-migration lease.
    #[builder(default = Duration::from_secs(3_600))]
    pub stuck_jobs_timeout: Duration,

    /// Propagate terminal job failures to the caller instead of only persisting them.
    #[builder(default = false)]
    pub run_inline: bool,

    #[builder(default = never_throttle())]
    pub throttler: Throttler,

    #[builder(default = log_error_handler())]
    pub error_handler: ErrorHandler,

    #[builder(default = tracing_events())]
    pub events: Arc<dyn EventSink>,
}

fn never_throttle() -> Throttler {
    Arc::new(|| false)
}

fn log_error_handler() -> ErrorHandler {
    Arc::new(log_job_error)
}

fn tracing_events() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}

fn log_job_error(err: &anyhow::Error, job: &Job) {
    error!(
        job_id = %job.id,
        migration_id = %job.migration_id,
        min_value = job.min_value,
        max_value = job.max_value,
        attempts = job.attempts,
        error = %format!("{:#}", err),
        "background migration job failed"
    );
}

impl Default for Settings {
    fn default() -> Self {
        Settings::builder().build()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("environment", &self.environment)
            .field("batch_size", &self.batch_size)
            .field("sub_batch_size", &self.sub_batch_size)
            .field("batch_pause_ms", &self.batch_pause_ms)
            .field("sub_batch_pause_ms", &self.sub_batch_pause_ms)
            .field("batch_max_attempts", &self.batch_max_attempts)
            .field("stuck_jobs_timeout", &self.stuck_jobs_timeout)
            .field("run_inline", &self.run_inline)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.batch_size <= 0 || self.sub_batch_size <= 0 {
            return Err(Error::Configuration(
                "batch_size and sub_batch_size must be positive".into(),
            ));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(Error::Configuration(format!(
                "sub_batch_size ({}) must not exceed batch_size ({})",
                self.sub_batch_size, self.batch_size
            )));
        }
        if self.batch_pause_ms < 0 || self.sub_batch_pause_ms < 0 {
            return Err(Error::Configuration("pauses must not be negative".into()));
        }
        if self.batch_max_attempts < 1 {
            return Err(Error::Configuration(
                "batch_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Jobs running with a heartbeat at or before this instant are stuck.
    pub fn stuck_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.stuck_jobs_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now.checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
