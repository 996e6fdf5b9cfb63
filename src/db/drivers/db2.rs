//! DB2 adapter, grounded on `odbc-api` (spec §4.3 "DB2 specifics" names
//! `SQLAllocHandle`/`SQLGetDiagRec` explicitly; `odbc-api` is the safe Rust
//! wrapper around exactly that ODBC surface).
//!
//! One process-wide ODBC [`Environment`] is shared across all DB2
//! connections, since each [`Connection`] borrows it. Prepared statements
//! are name-only, like SQLite: a statement handle allocated via
//! `SQLAllocHandle` only lives as long as the `Connection` that owns it, so
//! `prepare_stmt` records `name` + `sql_template` and `execute_prepared`
//! re-issues the statement each call. Re-registering an already-known name
//! is a no-op success, matching the `PreparedStatementCache` semantics in
//! the design notes.

use std::sync::OnceLock;

use odbc_api::{ConnectionOptions, Cursor, Environment, ResultSetMetadata};

use crate::db::connection_config::ConnectionConfig;
use crate::db::engine::{Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, IsolationLevel, PreparedStatement, QueryRequest, QueryResult, Status, Transaction};
use crate::db::json::{rows_to_json_array, CellValue};
use crate::error::Error;

type OdbcConnection = odbc_api::Connection<'static>;

static ODBC_ENV: OnceLock<Environment> = OnceLock::new();

fn environment() -> &'static Environment {
    ODBC_ENV.get_or_init(|| Environment::new().expect("failed to initialize ODBC environment"))
}

pub struct Db2Driver {
    available: bool,
}

impl Db2Driver {
    pub fn new() -> Self {
        Db2Driver { available: true }
    }

    fn conn_mut<'a>(&self, handle: &'a mut DatabaseHandle) -> Result<&'a mut OdbcConnection, Error> {
        if handle.engine_type != EngineTag::Db2 {
            return Err(Error::InvalidArgument(
                format!("handle engine_type is {}, not db2", handle.engine_type),
                String::from("Db2Driver"),
            ));
        }
        handle
            .connection_handle
            .as_mut()
            .and_then(|h| h.downcast_mut::<OdbcConnection>())
            .ok_or_else(|| Error::InvalidArgument(String::from("handle has no db2 connection"), String::from("Db2Driver")))
    }

    fn run_query(conn: &OdbcConnection, sql: &str) -> QueryResult {
        let cursor = match conn.execute(sql, ()) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return QueryResult::empty_success(),
            Err(e) => return QueryResult::failure(e.to_string()),
        };
        Self::drain_cursor(cursor)
    }

    fn drain_cursor<C: Cursor>(mut cursor: C) -> QueryResult {
        let columns: Vec<String> = match cursor.column_names().and_then(|names| names.collect::<Result<Vec<_>, _>>()) {
            Ok(names) => names,
            Err(e) => return QueryResult::failure(e.to_string()),
        };
        let column_count = columns.len();

        let mut data: Vec<Vec<CellValue>> = Vec::new();
        loop {
            let row = match cursor.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return QueryResult::failure(e.to_string()),
            };
            let mut row = row;
            let mut cells = Vec::with_capacity(column_count);
            for col in 1..=column_count as u16 {
                let mut buf: Vec<u8> = Vec::new();
                match row.get_text(col, &mut buf) {
                    Ok(true) => cells.push(CellValue::Text(String::from_utf8_lossy(&buf).into_owned())),
                    Ok(false) => cells.push(CellValue::Null),
                    Err(e) => return QueryResult::failure(e.to_string()),
                }
            }
            data.push(cells);
        }

        QueryResult {
            success: true,
            row_count: data.len(),
            column_count,
            affected_rows: 0,
            data_json: rows_to_json_array(&columns, &data),
            column_names: columns,
            error_message: None,
        }
    }
}

impl Driver for Db2Driver {
    fn engine_type(&self) -> EngineTag {
        EngineTag::Db2
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
        let conn = environment()
            .connect_with_connection_string(&config.connection_string, ConnectionOptions::default())
            .map_err(|e| Error::connection_failed(format!("db2 connect failed: {e}")))?;

        let mut handle = DatabaseHandle::new(EngineTag::Db2, config.clone(), designator.map(str::to_string), Status::Connected);
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
        conn.execute("SELECT 1 FROM SYSIBM.SYSDUMMY1", ()).is_ok()
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
        conn.set_autocommit(false)
            .map_err(|e| Error::new("failed to begin transaction", e.to_string()))?;
        Ok(Transaction::new(isolation))
    }

    fn commit_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("commit_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.commit().map_err(|e| Error::new("failed to commit transaction", e.to_string()))?;
        conn.set_autocommit(true).map_err(|e| Error::new("failed to restore autocommit", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn rollback_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("rollback_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.rollback().map_err(|e| Error::new("failed to rollback transaction", e.to_string()))?;
        conn.set_autocommit(true).map_err(|e| Error::new("failed to restore autocommit", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn validate_conn_string(&self, input: &str) -> bool {
        input.contains("DRIVER={")
    }
}
