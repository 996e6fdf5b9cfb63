//! Bootstrap and forward/reverse migration protocol — spec §4.6.
//!
//! Functions here take a `&dyn Driver` directly rather than looking one up
//! in the global [`crate::db::engine`] registry; the lead queue already
//! holds the `Arc<dyn Driver>` it connected through, and threading it in
//! keeps this module testable against a fake driver without touching
//! process-global state.

use std::collections::HashMap;

use regex::Regex;

use crate::db::engine::{Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, IsolationLevel, QueryRequest};
use crate::error::Error;

/// `QueryCacheEntry.type` used to look up a reverse-migration script for a
/// given `ref` (the migration ordinal being undone).
pub const REVERSE_MIGRATION_TYPE: i32 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootstrapCounters {
    pub latest_available_migration: i64,
    pub latest_loaded_migration: i64,
    pub latest_applied_migration: i64,
}

/// One entry of a database's query library (spec §3.1). Indexed by
/// `(ref_id, entry_type)`.
#[derive(Debug, Clone)]
pub struct QueryCacheEntry {
    pub ref_id: i64,
    pub entry_type: i32,
    pub sql: String,
    pub description: String,
    pub queue_label: String,
    pub timeout_seconds: u32,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<(i64, i32), QueryCacheEntry>,
}

impl QueryCache {
    pub fn new() -> Self {
        QueryCache::default()
    }

    pub fn insert(&mut self, entry: QueryCacheEntry) {
        self.entries.insert((entry.ref_id, entry.entry_type), entry);
    }

    pub fn get(&self, ref_id: i64, entry_type: i32) -> Option<&QueryCacheEntry> {
        self.entries.get(&(ref_id, entry_type))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One migration script as supplied by the external payload source (spec
/// §4.6.4). `size` from the original design is dropped; `data.len()` covers it.
#[derive(Debug, Clone)]
pub struct PayloadFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Looks up a script by exact name match. An empty table, or no match,
/// is treated identically by the caller: migration can't proceed.
pub fn find_payload_script<'a>(table: &'a [PayloadFile], name: &str) -> Option<&'a [u8]> {
    table.iter().find(|f| f.name == name).map(|f| f.data.as_slice())
}

/// Runs the bootstrap query and parses the three migration counters out of
/// its JSON result. The bootstrap SQL is expected to alias its columns as
/// `latest_available_migration`, `latest_loaded_migration`, and
/// `latest_applied_migration`.
pub fn run_bootstrap_query(driver: &dyn Driver, handle: &mut DatabaseHandle, bootstrap_sql: &str) -> Result<BootstrapCounters, Error> {
    let request = QueryRequest {
        sql_template: bootstrap_sql.to_string(),
        ..Default::default()
    };
    let result = driver.execute_query(handle, &request)?;
    if !result.success {
        return Err(Error::MigrationStuck(
            result.error_message.unwrap_or_else(|| String::from("bootstrap query failed")),
            String::from("run_bootstrap_query"),
        ));
    }
    parse_bootstrap_row(&result.data_json)
}

fn parse_bootstrap_row(data_json: &str) -> Result<BootstrapCounters, Error> {
    let rows: serde_json::Value = serde_json::from_str(data_json)?;
    let row = rows
        .get(0)
        .ok_or_else(|| Error::MigrationStuck(String::from("bootstrap query returned no rows"), String::from("parse_bootstrap_row")))?;

    let field = |name: &str| -> Result<i64, Error> {
        row.get(name)
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| Error::MigrationStuck(format!("bootstrap row missing `{name}`"), String::from("parse_bootstrap_row")))
    };

    Ok(BootstrapCounters {
        latest_available_migration: field("latest_available_migration")?,
        latest_loaded_migration: field("latest_loaded_migration")?,
        latest_applied_migration: field("latest_applied_migration")?,
    })
}

fn run_script_in_transaction(driver: &dyn Driver, handle: &mut DatabaseHandle, sql: &str, caller: &str) -> Result<(), Error> {
    let tx = driver.begin_tx(handle, IsolationLevel::default())?;
    handle.current_transaction = Some(tx);
    let request = QueryRequest {
        sql_template: sql.to_string(),
        ..Default::default()
    };
    match driver.execute_query(handle, &request) {
        Ok(result) if result.success => {
            driver.commit_tx(handle)?;
            Ok(())
        }
        Ok(result) => {
            driver.rollback_tx(handle)?;
            Err(Error::MigrationStuck(result.error_message.unwrap_or_default(), String::from(caller)))
        }
        Err(e) => {
            driver.rollback_tx(handle)?;
            Err(e)
        }
    }
}

/// Forward-apply loop (spec §4.6.2). Returns the refreshed counters once
/// `latest_applied_migration == latest_available_migration`, or an error if
/// `auto_migration` is disabled immediately returns the counters unchanged.
pub fn run_forward_migrations(
    driver: &dyn Driver,
    handle: &mut DatabaseHandle,
    auto_migration: bool,
    bootstrap_sql: &str,
    payload: &[PayloadFile],
    mut counters: BootstrapCounters,
    script_name_for_ordinal: impl Fn(i64) -> String,
) -> Result<BootstrapCounters, Error> {
    if !auto_migration {
        log::info!(target: "dbcore::migration", "Automatic Migration not enabled");
        return Ok(counters);
    }

    while counters.latest_applied_migration < counters.latest_available_migration {
        let target = counters.latest_applied_migration + 1;
        let script_name = script_name_for_ordinal(target);
        let script = find_payload_script(payload, &script_name).ok_or_else(|| {
            Error::MigrationStuck(format!("no script found for migration {target} (`{script_name}`)"), String::from("run_forward_migrations"))
        })?;
        let sql = String::from_utf8_lossy(script).into_owned();

        run_script_in_transaction(driver, handle, &sql, "run_forward_migrations")?;

        let refreshed = run_bootstrap_query(driver, handle, bootstrap_sql)?;
        if refreshed.latest_applied_migration != counters.latest_applied_migration + 1 {
            return Err(Error::MigrationStuck(
                format!(
                    "APPLY did not advance by exactly 1 applying migration {target} (was {}, now {})",
                    counters.latest_applied_migration, refreshed.latest_applied_migration
                ),
                String::from("run_forward_migrations"),
            ));
        }
        counters = refreshed;
    }

    Ok(counters)
}

/// Reverse-apply loop used by the test-mode migration process (spec §4.6.3).
pub fn run_reverse_migrations(
    driver: &dyn Driver,
    handle: &mut DatabaseHandle,
    bootstrap_sql: &str,
    cache: &QueryCache,
    mut counters: BootstrapCounters,
) -> Result<BootstrapCounters, Error> {
    loop {
        if counters.latest_applied_migration <= 0 {
            return Ok(counters);
        }

        let Some(entry) = cache.get(counters.latest_applied_migration, REVERSE_MIGRATION_TYPE) else {
            return Ok(counters);
        };
        let sql = entry.sql.clone();

        run_script_in_transaction(driver, handle, &sql, "run_reverse_migrations")?;

        let refreshed = run_bootstrap_query(driver, handle, bootstrap_sql)?;
        if refreshed.latest_applied_migration == counters.latest_applied_migration {
            return Err(Error::MigrationStuck(
                String::from("reverse migration made no progress"),
                String::from("run_reverse_migrations"),
            ));
        }
        counters = refreshed;
    }
}

/// Extracts a migration's display name from either a `PAYLOAD:`-prefixed
/// reference or a filesystem path (spec §4.6.5). `None` in, `None` out.
pub fn extract_migration_name(input: Option<&str>) -> Option<String> {
    let input = input?;
    if let Some(suffix) = input.strip_prefix("PAYLOAD:") {
        return Some(suffix.to_string());
    }
    Some(posix_basename(input))
}

fn posix_basename(input: &str) -> String {
    if input.is_empty() {
        return String::from(".");
    }
    let trimmed = input.trim_end_matches('/');
    if trimmed.is_empty() {
        // input was made entirely of slashes, e.g. "/" or "///"
        return String::from("/");
    }
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => trimmed.to_string(),
    }
}

/// Canonicalizes a backend name to its [`EngineTag`]; `postgres` aliases to
/// `Postgresql`. Unknown or absent input returns `None`.
pub fn normalize_engine_name(input: Option<&str>) -> Option<EngineTag> {
    match input?.to_lowercase().as_str() {
        "postgres" | "postgresql" => Some(EngineTag::Postgresql),
        "mysql" => Some(EngineTag::Mysql),
        "sqlite" => Some(EngineTag::Sqlite),
        "db2" => Some(EngineTag::Db2),
        _ => None,
    }
}

/// Enumerates `<label>_<slot>.lua` files in `migrations_dir`, where `<slot>`
/// is 1-6 characters of any content (the original design validates only the
/// length of this slot, not that it's numeric — a `testmig_abc.lua` file
/// passes just as `testmig_001.lua` does). Returns an empty list, not an
/// error, when the directory has no matches.
pub fn discover_path_migration_files(migrations_dir: &str, label: &str) -> Result<Vec<String>, Error> {
    let pattern = format!("^{}_(.{{1,6}})\\.lua$", regex::escape(label));
    let re = Regex::new(&pattern).expect("pattern built from escaped label is always valid");

    let mut matches = Vec::with_capacity(10);
    let entries = std::fs::read_dir(migrations_dir)?;
    for entry in entries {
        let entry = entry?;
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if re.is_match(&file_name) {
            matches.push(file_name);
        }
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection_config::ConnectionConfig;
    use crate::db::handle::{QueryResult, Status, Transaction};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn bootstrap_json(available: i64, loaded: i64, applied: i64) -> String {
        format!(
            r#"[{{"latest_available_migration":{available},"latest_loaded_migration":{loaded},"latest_applied_migration":{applied}}}]"#
        )
    }

    /// Drives `counters.latest_applied_migration` from whatever the harness
    /// sets up towards `latest_available_migration`, one step per query.
    struct SteppingDriver {
        available: i64,
        applied: AtomicI64,
    }

    impl Driver for SteppingDriver {
        fn engine_type(&self) -> EngineTag {
            EngineTag::Sqlite
        }

        fn is_available(&self) -> bool {
            true
        }

        fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
            Ok(DatabaseHandle::new(EngineTag::Sqlite, config.clone(), designator.map(str::to_string), Status::Connected))
        }

        fn disconnect(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
            handle.status = Status::Disconnected;
            Ok(())
        }

        fn health_check(&self, _handle: &mut DatabaseHandle) -> bool {
            true
        }

        fn execute_query(&self, _handle: &mut DatabaseHandle, request: &QueryRequest) -> Result<QueryResult, Error> {
            if request.sql_template == "BOOTSTRAP" {
                let applied = self.applied.load(Ordering::SeqCst);
                return Ok(QueryResult {
                    success: true,
                    row_count: 1,
                    column_count: 3,
                    affected_rows: 0,
                    column_names: vec![],
                    data_json: bootstrap_json(self.available, self.available, applied),
                    error_message: None,
                });
            }

            // Applying migration script `target`.
            let target: i64 = request.sql_template.parse().expect("test scripts are their own ordinal as text");
            self.applied.store(target, Ordering::SeqCst);
            Ok(QueryResult::empty_success())
        }

        fn begin_tx(&self, _handle: &mut DatabaseHandle, isolation: IsolationLevel) -> Result<Transaction, Error> {
            Ok(Transaction::new(isolation))
        }

        fn commit_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
            handle.current_transaction = None;
            Ok(())
        }

        fn rollback_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
            handle.current_transaction = None;
            Ok(())
        }
    }

    fn config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig::for_test(":memory:"))
    }

    #[test]
    fn extract_migration_name_handles_payload_prefix() {
        assert_eq!(extract_migration_name(Some("PAYLOAD:testmigration")), Some("testmigration".to_string()));
        assert_eq!(extract_migration_name(None), None);
    }

    #[test]
    fn extract_migration_name_handles_path() {
        assert_eq!(extract_migration_name(Some("/path/to/migrations/")), Some("migrations".to_string()));
        assert_eq!(extract_migration_name(Some("/")), Some("/".to_string()));
        assert_eq!(extract_migration_name(Some("")), Some(".".to_string()));
    }

    #[test]
    fn normalize_engine_name_aliases_postgres() {
        assert_eq!(normalize_engine_name(Some("postgres")), Some(EngineTag::Postgresql));
        assert_eq!(normalize_engine_name(Some("POSTGRESQL")), Some(EngineTag::Postgresql));
        assert_eq!(normalize_engine_name(Some("oracle")), None);
        assert_eq!(normalize_engine_name(None), None);
    }

    #[test]
    fn discover_path_migration_files_applies_stem_extension_and_slot_rules() {
        let dir = tempdir().unwrap();
        for name in [
            "testmig_001.lua",
            "testmig_002.lua",
            "testmig_999.lua",
            "other_001.lua",
            "testmig.lua",
            "testmig_abc.lua",
            "testmig_001.txt",
            "testmig_1234567.lua",
        ] {
            std::fs::write(dir.path().join(name), b"-- x").unwrap();
        }

        let mut found = discover_path_migration_files(dir.path().to_str().unwrap(), "testmig").unwrap();
        found.sort();
        assert_eq!(found, vec!["testmig_001.lua", "testmig_002.lua", "testmig_999.lua", "testmig_abc.lua"]);
    }

    #[test]
    fn forward_migrations_advance_one_at_a_time_to_the_target() {
        let driver = SteppingDriver {
            available: 3,
            applied: AtomicI64::new(0),
        };
        let mut handle = driver.connect(&config(), None).unwrap();
        let counters = run_bootstrap_query(&driver, &mut handle, "BOOTSTRAP").unwrap();
        assert_eq!(counters.latest_applied_migration, 0);

        let payload = vec![
            PayloadFile { name: "1".to_string(), data: b"1".to_vec() },
            PayloadFile { name: "2".to_string(), data: b"2".to_vec() },
            PayloadFile { name: "3".to_string(), data: b"3".to_vec() },
        ];

        let result = run_forward_migrations(&driver, &mut handle, true, "BOOTSTRAP", &payload, counters, |n| n.to_string()).unwrap();
        assert_eq!(result.latest_applied_migration, 3);
    }

    #[test]
    fn forward_migrations_no_op_when_auto_migration_disabled() {
        let driver = SteppingDriver {
            available: 3,
            applied: AtomicI64::new(0),
        };
        let mut handle = driver.connect(&config(), None).unwrap();
        let counters = run_bootstrap_query(&driver, &mut handle, "BOOTSTRAP").unwrap();
        let result = run_forward_migrations(&driver, &mut handle, false, "BOOTSTRAP", &[], counters, |n| n.to_string()).unwrap();
        assert_eq!(result, counters);
    }

    #[test]
    fn forward_migrations_fail_fast_on_missing_script() {
        let driver = SteppingDriver {
            available: 1,
            applied: AtomicI64::new(0),
        };
        let mut handle = driver.connect(&config(), None).unwrap();
        let counters = run_bootstrap_query(&driver, &mut handle, "BOOTSTRAP").unwrap();
        let result = run_forward_migrations(&driver, &mut handle, true, "BOOTSTRAP", &[], counters, |n| n.to_string());
        assert!(matches!(result, Err(Error::MigrationStuck(..))));
    }

    #[test]
    fn reverse_migrations_stop_at_zero() {
        let driver = SteppingDriver {
            available: 0,
            applied: AtomicI64::new(0),
        };
        let mut handle = driver.connect(&config(), None).unwrap();
        let counters = BootstrapCounters {
            latest_available_migration: 0,
            latest_loaded_migration: 0,
            latest_applied_migration: 0,
        };
        let cache = QueryCache::new();
        let result = run_reverse_migrations(&driver, &mut handle, "BOOTSTRAP", &cache, counters).unwrap();
        assert_eq!(result.latest_applied_migration, 0);
    }

    #[test]
    fn reverse_migrations_stop_gracefully_when_no_reverse_script_registered() {
        let driver = SteppingDriver {
            available: 3,
            applied: AtomicI64::new(3),
        };
        let mut handle = driver.connect(&config(), None).unwrap();
        let counters = BootstrapCounters {
            latest_available_migration: 3,
            latest_loaded_migration: 3,
            latest_applied_migration: 3,
        };
        let cache = QueryCache::new();
        let result = run_reverse_migrations(&driver, &mut handle, "BOOTSTRAP", &cache, counters).unwrap();
        assert_eq!(result.latest_applied_migration, 3);
    }
}
