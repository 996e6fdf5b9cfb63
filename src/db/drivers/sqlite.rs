//! SQLite adapter, grounded on `rusqlite`.
//!
//! `rusqlite::Statement<'conn>` borrows its `Connection`, so it can't be
//! boxed into `engine_specific_handle` alongside that same connection
//! without a self-referential struct. Prepared statements here are
//! name-only: `prepare_stmt` records the name and `sql_template` with a
//! `Some(Box::new(()))` sentinel (preserving the "non-null means prepared"
//! invariant other adapters rely on), and `execute_prepared` re-prepares from
//! `sql_template` each call.

use rusqlite::{Connection, Row as SqliteRow};

use crate::db::connection_config::ConnectionConfig;
use crate::db::engine::{Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, IsolationLevel, PreparedStatement, QueryRequest, QueryResult, Status, Transaction};
use crate::db::json::{rows_to_json_array, CellValue};
use crate::error::Error;

pub struct SqliteDriver {
    available: bool,
}

impl SqliteDriver {
    pub fn new() -> Self {
        SqliteDriver { available: true }
    }

    fn conn_mut<'a>(&self, handle: &'a mut DatabaseHandle) -> Result<&'a mut Connection, Error> {
        if handle.engine_type != EngineTag::Sqlite {
            return Err(Error::InvalidArgument(
                format!("handle engine_type is {}, not sqlite", handle.engine_type),
                String::from("SqliteDriver"),
            ));
        }
        handle
            .connection_handle
            .as_mut()
            .and_then(|h| h.downcast_mut::<Connection>())
            .ok_or_else(|| Error::InvalidArgument(String::from("handle has no sqlite connection"), String::from("SqliteDriver")))
    }

    fn convert_value(row: &SqliteRow, idx: usize) -> CellValue {
        use rusqlite::types::ValueRef;
        match row.get_ref(idx) {
            Ok(ValueRef::Null) => CellValue::Null,
            Ok(ValueRef::Integer(i)) => CellValue::Numeric(i.to_string()),
            Ok(ValueRef::Real(f)) => CellValue::Numeric(f.to_string()),
            Ok(ValueRef::Text(t)) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            Ok(ValueRef::Blob(b)) => CellValue::Text(String::from_utf8_lossy(b).into_owned()),
            Err(_) => CellValue::Null,
        }
    }

    fn run_query(conn: &Connection, sql: &str) -> QueryResult {
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(e) => return QueryResult::failure(e.to_string()),
        };
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = columns.len();

        let result = stmt.query_map([], |row| {
            Ok((0..column_count).map(|i| Self::convert_value(row, i)).collect::<Vec<CellValue>>())
        });

        match result {
            Ok(mapped) => {
                let mut data = Vec::new();
                for row in mapped {
                    match row {
                        Ok(cells) => data.push(cells),
                        Err(e) => return QueryResult::failure(e.to_string()),
                    }
                }
                let affected_rows = conn.changes();
                QueryResult {
                    success: true,
                    row_count: data.len(),
                    column_count,
                    affected_rows,
                    data_json: rows_to_json_array(&columns, &data),
                    column_names: columns,
                    error_message: None,
                }
            }
            Err(e) => QueryResult::failure(e.to_string()),
        }
    }
}

impl Driver for SqliteDriver {
    fn engine_type(&self) -> EngineTag {
        EngineTag::Sqlite
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
        let conn = Connection::open(&config.database)
            .map_err(|e| Error::connection_failed(format!("sqlite open failed: {e}")))?;

        let mut handle = DatabaseHandle::new(EngineTag::Sqlite, config.clone(), designator.map(str::to_string), Status::Connected);
        handle.connection_handle = Some(Box::new(conn));
        Ok(handle)
    }

    fn disconnect(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        handle.connection_handle = None;
        handle.status = Status::Disconnected;
        Ok(())
    }

    fn health_check(&self, handle: &mut DatabaseHandle) -> bool {
        let Ok(conn) = self.conn_mut(handle) else {
            return false;
        };
        conn.execute_batch("SELECT 1").is_ok()
    }

    fn execute_query(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> Result<QueryResult, Error> {
        let conn = self.conn_mut(handle)?;
        Ok(Self::run_query(conn, &request.sql_template))
    }

    fn execute_prepared(&self, handle: &mut DatabaseHandle, stmt: &PreparedStatement, _request: &QueryRequest) -> Result<QueryResult, Error> {
        if stmt.engine_specific_handle.is_none() {
            return Ok(QueryResult::empty_success());
        }
        let sql = stmt.sql_template.clone();
        let conn = self.conn_mut(handle)?;
        Ok(Self::run_query(conn, &sql))
    }

    fn prepare_stmt(&self, handle: &mut DatabaseHandle, name: &str, sql: &str) -> Result<(), Error> {
        if handle.find_prepared(name).is_some() {
            return Ok(());
        }
        let cache_size = handle.config.prepared_statement_cache_size.max(1) as usize;
        let stmt = PreparedStatement::new(name, sql, Some(Box::new(())));
        handle.insert_prepared(stmt, cache_size);
        Ok(())
    }

    fn unprepare_stmt(&self, handle: &mut DatabaseHandle, name: &str) -> Result<(), Error> {
        handle.remove_prepared(name);
        Ok(())
    }

    fn begin_tx(&self, handle: &mut DatabaseHandle, isolation: IsolationLevel) -> Result<Transaction, Error> {
        let conn = self.conn_mut(handle)?;
        conn.execute_batch("BEGIN")
            .map_err(|e| Error::new("failed to begin transaction", e.to_string()))?;
        Ok(Transaction::new(isolation))
    }

    fn commit_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("commit_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.execute_batch("COMMIT")
            .map_err(|e| Error::new("failed to commit transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn rollback_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("rollback_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.execute_batch("ROLLBACK")
            .map_err(|e| Error::new("failed to rollback transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn validate_conn_string(&self, input: &str) -> bool {
        !input.is_empty()
    }

    fn escape_string(&self, handle: &DatabaseHandle, input: &str) -> Option<String> {
        if handle.engine_type != EngineTag::Sqlite {
            return None;
        }
        Some(input.replace('\'', "''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn in_memory_connection_string_is_valid() {
        let config = ConnectionConfig::for_test(":memory:");
        let driver = SqliteDriver::new();
        let handle = driver.connect(&config, None).expect("in-memory sqlite always connects");
        assert_eq!(handle.engine_type, EngineTag::Sqlite);
    }

    #[test]
    fn validate_conn_string_rejects_empty() {
        let driver = SqliteDriver::new();
        assert!(!driver.validate_conn_string(""));
        assert!(driver.validate_conn_string("/tmp/x.db"));
    }

    #[test]
    fn escape_string_is_none_for_other_engine_type() {
        let driver = SqliteDriver::new();
        let config = Arc::new(ConnectionConfig::for_test(":memory:"));
        let handle = DatabaseHandle::new(EngineTag::Postgresql, config, None, Status::Connected);
        assert!(driver.escape_string(&handle, "it's").is_none());
    }

    #[test]
    fn duplicate_prepare_is_a_no_op_success() {
        let config = ConnectionConfig::for_test(":memory:");
        let driver = SqliteDriver::new();
        let mut handle = driver.connect(&config, None).unwrap();
        driver.prepare_stmt(&mut handle, "q1", "select 1").unwrap();
        driver.prepare_stmt(&mut handle, "q1", "select 1").unwrap();
        assert_eq!(handle.prepared_statement_count(), 1);
    }
}
