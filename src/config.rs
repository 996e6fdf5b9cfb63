//! Process-wide tunables for the database core.
//!
//! These are distinct from the per-database [`crate::db::connection_config::ConnectionConfig`]
//! and [`crate::db::queue::DatabaseConfig`] records, which are supplied by the
//! external configuration loader (spec §6.1) for each configured database.
//! `Config` only holds the handful of ambient settings that apply across all
//! databases: pool defaults, logging, and shutdown behavior.

use std::sync::OnceLock;

use crate::util::{get_env, get_env_bool};

pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Returns the process-wide config, loading it from the environment on first
/// access. Safe to call from any thread; loading happens at most once.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Log level passed to `fern`/`log`. Valid values are "trace", "debug",
    /// "info", "warn", "error" and "off".
    pub log_level: String,
    /// Optional log file path; stdout is always used in addition.
    pub log_file: Option<String>,

    /// Timeout in seconds when acquiring a connection from the pool.
    pub database_timeout: u64,
    /// Maximum size of a per-database connection pool.
    pub database_max_conns: u32,
    /// Minimum number of idle connections a pool tries to keep warm.
    pub database_min_conns: u32,
    /// Idle timeout in seconds before a pooled connection is recycled.
    pub database_idle_timeout: u64,
    /// Default size of a connection's prepared-statement LRU cache, used
    /// when `ConnectionConfig.prepared_statement_cache_size` is zero.
    pub default_prepared_statement_cache_size: u32,

    /// Number of times to retry the lead queue's initial connection during
    /// startup, with 1 second between each retry; 0 retries indefinitely.
    pub db_connection_retries: u32,

    /// Turn on SQLite's WAL journal mode for file-backed databases.
    pub enable_db_wal: bool,

    /// Seconds workers are given to drain in-flight requests on shutdown
    /// before the manager forces connections closed.
    pub shutdown_drain_seconds: u64,
}

impl Config {
    fn load() -> Self {
        let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
        match dotenvy::from_path(&env_file) {
            Ok(_) => log::info!(target: "dbcore::config", "Using environment file `{env_file}` for configuration"),
            Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Only warn if the user asked for a specific file that isn't there.
                if get_env::<String>("ENV_FILE").is_some() {
                    log::warn!(target: "dbcore::config", "Configured ENV_FILE `{env_file}` was not found");
                }
            }
            Err(e) => log::warn!(target: "dbcore::config", "Failed reading environment file `{env_file}`: {e:?}"),
        }

        Config {
            log_level: get_env("LOG_LEVEL").unwrap_or_else(|| String::from("info")),
            log_file: get_env("LOG_FILE"),

            database_timeout: get_env("DATABASE_TIMEOUT").unwrap_or(30),
            database_max_conns: get_env("DATABASE_MAX_CONNS").unwrap_or(10),
            database_min_conns: get_env("DATABASE_MIN_CONNS").unwrap_or(1),
            database_idle_timeout: get_env("DATABASE_IDLE_TIMEOUT").unwrap_or(600),
            default_prepared_statement_cache_size: get_env("PREPARED_STATEMENT_CACHE_SIZE").unwrap_or(100),

            db_connection_retries: get_env("DB_CONNECTION_RETRIES").unwrap_or(15),

            enable_db_wal: get_env_bool("ENABLE_DB_WAL").unwrap_or(true),

            shutdown_drain_seconds: get_env("SHUTDOWN_DRAIN_SECONDS").unwrap_or(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_falls_back_to_defaults_when_env_unset() {
        let cfg = Config::load();
        assert!(!cfg.log_level.is_empty());
        assert!(cfg.database_max_conns >= 1);
    }
}
