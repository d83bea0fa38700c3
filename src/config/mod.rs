//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;
pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::rule::parse_duration;
use crate::rules::DEFAULT_TENANT;
use secrecy::SecretString;

pub use store::StoreConfig;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct Config {
    /// From `DATABASE_URL`, or generated from the `DB_CONFIG_PATH` file.
    pub database_url: Option<SecretString>,
    pub rules_path: PathBuf,
    pub default_tenant: String,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    pub eval_timeout: Option<Duration>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = match (var("DATABASE_URL"), var("DB_CONFIG_PATH")) {
            (Some(url), _) => Some(SecretString::from(url)),
            (None, Some(path)) => Some(StoreConfig::from_file(path)?.to_dsn()),
            (None, None) => None,
        };

        let rules_path = var("RULES_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| missing("RULES_PATH"))?;

        let cleanup_interval = duration_var(&var, "CLEANUP_INTERVAL")?
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL);
        // Retention follows the sweep period unless set on its own.
        let retention = duration_var(&var, "RETENTION")?.unwrap_or(cleanup_interval);
        if cleanup_interval.is_zero() {
            return Err(Error::Config("CLEANUP_INTERVAL must be positive".into()));
        }

        Ok(Self {
            database_url,
            rules_path,
            default_tenant: var("DEFAULT_TENANT").unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            cleanup_interval,
            retention,
            eval_timeout: duration_var(&var, "EVAL_TIMEOUT")?,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// The Postgres DSN, for commands that need the database.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("neither DATABASE_URL nor DB_CONFIG_PATH is set".to_string())
        })
    }
}

fn duration_var(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    var(name)
        .map(|v| parse_duration(&v).map_err(|e| Error::Config(format!("{name}: {e}"))))
        .transpose()
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}
