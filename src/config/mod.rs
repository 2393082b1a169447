//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;
pub mod stages;

pub use stages::{StageProfile, StageProfiles};

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// Postgres with the pgmq extension. Only the commands that touch the
    /// real transport need it, so it is checked lazily.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub pipeline: PipelineSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            pipeline: PipelineSettings::from_env()?,
        })
    }

    /// The database URL, or a config error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}

/// Queue names and timing bounds for the stage workers.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub ingress_queue: String,
    pub step1_queue: String,
    pub step2_queue: String,
    pub visibility_timeout: Duration,
    pub receive_wait: Duration,
    pub send_timeout: Duration,
    pub retry_backoff: Duration,
    pub stages_file: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ingress_queue: "pipeline_ingress".to_string(),
            step1_queue: "pipeline_step_1".to_string(),
            step2_queue: "pipeline_step_2".to_string(),
            visibility_timeout: Duration::from_secs(30),
            receive_wait: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
            stages_file: None,
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup. Unset variables
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            ingress_queue: lookup("PIPELINE_INGRESS_QUEUE").unwrap_or(defaults.ingress_queue),
            step1_queue: lookup("PIPELINE_STEP1_QUEUE").unwrap_or(defaults.step1_queue),
            step2_queue: lookup("PIPELINE_STEP2_QUEUE").unwrap_or(defaults.step2_queue),
            visibility_timeout: seconds_var(
                &lookup,
                "PIPELINE_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            )?,
            receive_wait: seconds_var(&lookup, "PIPELINE_RECEIVE_WAIT_SECS", defaults.receive_wait)?,
            send_timeout: seconds_var(&lookup, "PIPELINE_SEND_TIMEOUT_SECS", defaults.send_timeout)?,
            retry_backoff: seconds_var(
                &lookup,
                "PIPELINE_RETRY_BACKOFF_SECS",
                defaults.retry_backoff,
            )?,
            stages_file: lookup("PIPELINE_STAGES_FILE").map(PathBuf::from),
        };

        if settings.send_timeout >= settings.receive_wait {
            return Err(Error::Config(format!(
                "PIPELINE_SEND_TIMEOUT_SECS ({}s) must be shorter than PIPELINE_RECEIVE_WAIT_SECS ({}s)",
                settings.send_timeout.as_secs(),
                settings.receive_wait.as_secs()
            )));
        }

        Ok(settings)
    }

    /// Load the stage profiles file if one is configured, else defaults.
    pub fn stage_profiles(&self) -> Result<StageProfiles> {
        match self.stages_file {
            Some(ref path) => StageProfiles::load(path),
            None => Ok(StageProfiles::default()),
        }
    }
}

fn seconds_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not a number of seconds: {e}"))),
        None => Ok(default),
    }
}
