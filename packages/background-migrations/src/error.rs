//! Error taxonomy for the background migration engine.
//!
//! - Validation errors are raised synchronously when a migration or job is defined.
//! - Processing errors come from user callbacks and are persisted on the job; they only
//!   surface as [`Error::Processing`] in run-inline mode.
//! - Configuration and environment errors fail fast and are never retried.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown background migration: {0}")]
    UnknownMigration(String),

    #[error("Background migration '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Background migration {0} not found")]
    MigrationNotFound(Uuid),

    #[error("Background migration job {0} not found")]
    JobNotFound(Uuid),

    #[error("Invalid {record} status transition: {from} -> {to}")]
    InvalidTransition {
        record: &'static str,
        from: &'static str,
        to: &'static str,
    },

    #[error("{record} {id} was modified concurrently")]
    StaleRecord { record: &'static str, id: Uuid },

    #[error("Composite migration {0} cannot be run directly, run its children instead")]
    CompositeMigration(Uuid),

    #[error("{0} is not intended for production environments")]
    NotForProduction(&'static str),

    #[error("Job {job_id} failed: {source:#}")]
    Processing {
        job_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable name of the variant, persisted as a job's `error_class`.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Validation(_) => "Validation",
            Error::Configuration(_) => "Configuration",
            Error::UnknownMigration(_) => "UnknownMigration",
            Error::DuplicateRegistration(_) => "DuplicateRegistration",
            Error::MigrationNotFound(_) => "MigrationNotFound",
            Error::JobNotFound(_) => "JobNotFound",
            Error::InvalidTransition { .. } => "InvalidTransition",
            Error::StaleRecord { .. } => "StaleRecord",
            Error::CompositeMigration(_) => "CompositeMigration",
            Error::NotForProduction(_) => "NotForProduction",
            Error::Processing { .. } => "Processing",
            Error::Database(_) => "Database",
            Error::Migrate(_) => "Migrate",
            Error::Internal(_) => "Internal",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
