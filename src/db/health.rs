//! Subsystem-wide health probe and init/shutdown lifecycle — spec §4.7.
//!
//! Distinct from a single connection's [`crate::db::handle::Status`]: this
//! tracks whether the database subsystem as a whole has been brought up and
//! not yet torn down, the boolean the launch/landing framework polls.

use std::sync::atomic::{AtomicBool, Ordering};

static SUBSYSTEM_UP: AtomicBool = AtomicBool::new(false);

/// Idempotent; safe to call more than once.
pub fn database_subsystem_init() {
    if !SUBSYSTEM_UP.swap(true, Ordering::SeqCst) {
        log::info!(target: "dbcore::health", "database subsystem initialized");
    }
}

/// Idempotent; a second call after shutdown is a no-op.
pub fn database_subsystem_shutdown() {
    if SUBSYSTEM_UP.swap(false, Ordering::SeqCst) {
        log::info!(target: "dbcore::health", "database subsystem shut down");
    }
}

/// `true` iff the subsystem has been initialized and not subsequently shut down.
pub fn database_health_check() -> bool {
    SUBSYSTEM_UP.load(Ordering::SeqCst)
}

/// One line per configured database, for operators — not part of the
/// boolean probe external callers poll, but useful on a status endpoint or
/// in a startup log line.
pub struct DatabaseHealthEntry {
    pub database_name: String,
    pub connected: bool,
    pub latest_applied_migration: i64,
    pub latest_available_migration: i64,
}

pub fn health_report(entries: Vec<DatabaseHealthEntry>) -> String {
    if entries.is_empty() {
        return String::from("no databases configured");
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{}: {} (migration {}/{})",
                e.database_name,
                if e.connected { "up" } else { "down" },
                e.latest_applied_migration,
                e.latest_available_migration
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn health_check_reflects_init_and_shutdown() {
        database_subsystem_shutdown();
        assert!(!database_health_check());

        database_subsystem_init();
        assert!(database_health_check());

        database_subsystem_shutdown();
        assert!(!database_health_check());
    }

    #[test]
    #[serial]
    fn init_and_shutdown_are_idempotent() {
        database_subsystem_shutdown();
        database_subsystem_init();
        database_subsystem_init();
        assert!(database_health_check());
        database_subsystem_shutdown();
        database_subsystem_shutdown();
        assert!(!database_health_check());
    }

    #[test]
    fn health_report_formats_entries() {
        let entries = vec![DatabaseHealthEntry {
            database_name: "primary".to_string(),
            connected: true,
            latest_applied_migration: 3,
            latest_available_migration: 3,
        }];
        assert_eq!(health_report(entries), "primary: up (migration 3/3)");
    }

    #[test]
    fn health_report_handles_no_databases() {
        assert_eq!(health_report(vec![]), "no databases configured");
    }
}
