//! Live connections, prepared statements, and transactions — spec §3.1, §4.4.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::db::connection_config::ConnectionConfig;
use crate::db::engine::EngineTag;
use crate::util::get_uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connected,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: String,
    pub isolation_level: IsolationLevel,
    pub active: bool,
}

impl Transaction {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Transaction {
            transaction_id: get_uuid(),
            isolation_level,
            active: true,
        }
    }
}

/// One cached statement on a connection. `engine_specific_handle` is the
/// opaque driver-owned resource; `None` means a comment-only script whose
/// execution is synthesized as an empty result set rather than dispatched
/// (spec §4.3, §9 "Prepared-statement lifetime edge").
pub struct PreparedStatement {
    pub name: String,
    pub sql_template: String,
    pub engine_specific_handle: Option<Box<dyn Any + Send + Sync>>,
    pub usage_count: u64,
    pub last_used_tick: u64,
}

impl PreparedStatement {
    pub fn new(name: impl Into<String>, sql_template: impl Into<String>, handle: Option<Box<dyn Any + Send + Sync>>) -> Self {
        PreparedStatement {
            name: name.into(),
            sql_template: sql_template.into(),
            engine_specific_handle: handle,
            usage_count: 0,
            last_used_tick: 0,
        }
    }

    pub fn is_comment_only(&self) -> bool {
        self.engine_specific_handle.is_none()
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.name)
            .field("sql_template", &self.sql_template)
            .field("has_handle", &self.engine_specific_handle.is_some())
            .field("usage_count", &self.usage_count)
            .field("last_used_tick", &self.last_used_tick)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum QueryParam {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub sql_template: String,
    pub parameters: Option<Vec<QueryParam>>,
    pub prepared_name: Option<String>,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
    pub affected_rows: u64,
    pub column_names: Vec<String>,
    pub data_json: String,
    pub error_message: Option<String>,
}

impl QueryResult {
    pub fn empty_success() -> Self {
        QueryResult {
            success: true,
            row_count: 0,
            column_count: 0,
            affected_rows: 0,
            column_names: Vec::new(),
            data_json: "[]".to_string(),
            error_message: None,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        QueryResult {
            success: false,
            row_count: 0,
            column_count: 0,
            affected_rows: 0,
            column_names: Vec::new(),
            data_json: "[]".to_string(),
            error_message: Some(msg.into()),
        }
    }
}

/// One live connection. Mirrors spec §3.1's `DatabaseHandle`. The prepared
/// statement LRU lives here rather than in a free function, since eviction
/// needs exclusive access to the handle's statement list and its caller
/// already holds `connection_lock` while driving any driver call.
pub struct DatabaseHandle {
    pub engine_type: EngineTag,
    pub designator: Option<String>,
    pub connection_handle: Option<Box<dyn Any + Send>>,
    pub config: Arc<ConnectionConfig>,
    pub status: Status,
    pub current_transaction: Option<Transaction>,
    prepared_statements: Vec<PreparedStatement>,
    lru_tick: u64,
    /// Serializes all driver calls against this handle (spec §5).
    pub connection_lock: Mutex<()>,
}

impl DatabaseHandle {
    pub fn new(engine_type: EngineTag, config: impl Into<Arc<ConnectionConfig>>, designator: Option<String>, status: Status) -> Self {
        DatabaseHandle {
            engine_type,
            designator,
            connection_handle: None,
            config: config.into(),
            status,
            current_transaction: None,
            prepared_statements: Vec::new(),
            lru_tick: 0,
            connection_lock: Mutex::new(()),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.lru_tick += 1;
        self.lru_tick
    }

    pub fn prepared_statement_count(&self) -> usize {
        self.prepared_statements.len()
    }

    pub fn prepared_statements(&self) -> &[PreparedStatement] {
        &self.prepared_statements
    }

    pub fn find_prepared(&self, name: &str) -> Option<&PreparedStatement> {
        self.prepared_statements.iter().find(|s| s.name == name)
    }

    pub fn find_prepared_mut(&mut self, name: &str) -> Option<&mut PreparedStatement> {
        self.prepared_statements.iter_mut().find(|s| s.name == name)
    }

    /// Bumps the use-tick of a known prepared statement (spec §4.4 "On use,
    /// bump the entry's counter to the next tick").
    pub fn touch_prepared(&mut self, name: &str) {
        let tick = self.next_tick();
        if let Some(stmt) = self.find_prepared_mut(name) {
            stmt.usage_count += 1;
            stmt.last_used_tick = tick;
        }
    }

    /// Inserts a prepared statement, evicting the entry with the smallest
    /// `last_used_tick` (ties broken by lowest index) if the list is already
    /// at `cache_size`. Returns the evicted statement, if any, so the caller
    /// can finalize its driver-specific handle.
    pub fn insert_prepared(&mut self, mut stmt: PreparedStatement, cache_size: usize) -> Option<PreparedStatement> {
        let tick = self.next_tick();
        stmt.last_used_tick = tick;

        let cache_size = cache_size.max(1);
        if self.prepared_statements.len() < cache_size {
            self.prepared_statements.push(stmt);
            return None;
        }

        let victim_index = self
            .prepared_statements
            .iter()
            .enumerate()
            .min_by_key(|(i, s)| (s.last_used_tick, *i))
            .map(|(i, _)| i)
            .expect("cache_size >= 1 implies a non-empty list when full");
        let evicted = self.prepared_statements.swap_remove(victim_index);
        self.prepared_statements.push(stmt);
        Some(evicted)
    }

    /// Removes by name via swap-with-last compaction (spec §4.3 `unprepare`).
    pub fn remove_prepared(&mut self, name: &str) -> Option<PreparedStatement> {
        let idx = self.prepared_statements.iter().position(|s| s.name == name)?;
        Some(self.prepared_statements.swap_remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig::for_test("test"))
    }

    fn stmt(name: &str) -> PreparedStatement {
        PreparedStatement::new(name, format!("select {name}"), Some(Box::new(())))
    }

    #[test]
    fn lru_eviction_picks_smallest_tick() {
        let mut handle = DatabaseHandle::new(EngineTag::Sqlite, config(), None, Status::Connected);
        assert!(handle.insert_prepared(stmt("a"), 3).is_none());
        assert!(handle.insert_prepared(stmt("b"), 3).is_none());
        assert!(handle.insert_prepared(stmt("c"), 3).is_none());

        handle.touch_prepared("a");

        let evicted = handle.insert_prepared(stmt("d"), 3).expect("cache is full, must evict");
        assert_eq!(evicted.name, "b");

        let mut names: Vec<&str> = handle.prepared_statements().iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn prepared_statement_count_tracks_insert_and_remove() {
        let mut handle = DatabaseHandle::new(EngineTag::Sqlite, config(), None, Status::Connected);
        handle.insert_prepared(stmt("a"), 10);
        handle.insert_prepared(stmt("b"), 10);
        assert_eq!(handle.prepared_statement_count(), 2);
        handle.remove_prepared("a");
        assert_eq!(handle.prepared_statement_count(), 1);
        assert!(handle.find_prepared("a").is_none());
        assert!(handle.find_prepared("b").is_some());
    }

    #[test]
    fn comment_only_statement_has_no_handle() {
        let s = PreparedStatement::new("noop", "-- just a comment", None);
        assert!(s.is_comment_only());
    }
}
