//! PostgreSQL adapter, grounded on the `postgres` crate's blocking `Client`.
//!
//! `postgres::Statement` is an owned, reference-counted handle (it doesn't
//! borrow from `Client`), so prepared statements here store the real native
//! object in `engine_specific_handle` rather than falling back to the
//! name-only cache the SQLite/DB2 adapters need.

use postgres::{Client, NoTls, Row as PgRow};

use crate::db::connection_config::ConnectionConfig;
use crate::db::engine::{Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, IsolationLevel, PreparedStatement, QueryRequest, QueryResult, Status, Transaction};
use crate::db::json::{rows_to_json_array, CellValue};
use crate::error::Error;

pub struct PostgresqlDriver {
    available: bool,
}

impl PostgresqlDriver {
    pub fn new() -> Self {
        PostgresqlDriver { available: true }
    }

    fn client_mut<'a>(&self, handle: &'a mut DatabaseHandle) -> Result<&'a mut Client, Error> {
        if handle.engine_type != EngineTag::Postgresql {
            return Err(Error::InvalidArgument(
                format!("handle engine_type is {}, not postgresql", handle.engine_type),
                String::from("PostgresqlDriver"),
            ));
        }
        handle
            .connection_handle
            .as_mut()
            .and_then(|h| h.downcast_mut::<Client>())
            .ok_or_else(|| Error::InvalidArgument(String::from("handle has no postgresql connection"), String::from("PostgresqlDriver")))
    }

    fn convert_row(row: &PgRow) -> Vec<CellValue> {
        (0..row.len()).map(|i| Self::convert_value(row, i)).collect()
    }

    fn convert_value(row: &PgRow, idx: usize) -> CellValue {
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v.map(|n| CellValue::Numeric(n.to_string())).unwrap_or(CellValue::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v.map(|n| CellValue::Numeric(n.to_string())).unwrap_or(CellValue::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v.map(|n| CellValue::Numeric(n.to_string())).unwrap_or(CellValue::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v.map(|b| CellValue::Numeric(b.to_string())).unwrap_or(CellValue::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v.map(CellValue::Text).unwrap_or(CellValue::Null);
        }
        CellValue::Null
    }

    fn column_names(row: &PgRow) -> Vec<String> {
        row.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn run_query(&self, client: &mut Client, sql: &str) -> QueryResult {
        match client.query(sql, &[]) {
            Ok(rows) => {
                let columns = rows.first().map(Self::column_names).unwrap_or_default();
                let data: Vec<Vec<CellValue>> = rows.iter().map(Self::convert_row).collect();
                QueryResult {
                    success: true,
                    row_count: data.len(),
                    column_count: columns.len(),
                    affected_rows: 0,
                    data_json: rows_to_json_array(&columns, &data),
                    column_names: columns,
                    error_message: None,
                }
            }
            Err(e) => QueryResult::failure(e.to_string()),
        }
    }
}

impl Driver for PostgresqlDriver {
    fn engine_type(&self) -> EngineTag {
        EngineTag::Postgresql
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
        let client = Client::connect(&config.connection_string, NoTls)
            .map_err(|e| Error::connection_failed(format!("postgresql connect failed: {e}")))?;

        let mut handle = DatabaseHandle::new(EngineTag::Postgresql, config.clone(), designator.map(str::to_string), Status::Connected);
        handle.connection_handle = Some(Box::new(client));
        Ok(handle)
    }

    fn disconnect(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        handle.connection_handle = None;
        handle.status = Status::Disconnected;
        Ok(())
    }

    fn health_check(&self, handle: &mut DatabaseHandle) -> bool {
        let Ok(client) = self.client_mut(handle) else {
            return false;
        };
        client.simple_query("SELECT 1").is_ok()
    }

    fn execute_query(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> Result<QueryResult, Error> {
        let client = self.client_mut(handle)?;
        Ok(self.run_query(client, &request.sql_template))
    }

    fn execute_prepared(&self, handle: &mut DatabaseHandle, stmt: &PreparedStatement, _request: &QueryRequest) -> Result<QueryResult, Error> {
        if stmt.engine_specific_handle.is_none() {
            return Ok(QueryResult::empty_success());
        }
        let client = self.client_mut(handle)?;
        Ok(self.run_query(client, &stmt.sql_template))
    }

    fn prepare_stmt(&self, handle: &mut DatabaseHandle, name: &str, sql: &str) -> Result<(), Error> {
        let cache_size = handle.config.prepared_statement_cache_size.max(1) as usize;
        let client = self.client_mut(handle)?;
        let native = client
            .prepare(sql)
            .map_err(|e| Error::new(format!("failed to prepare statement `{name}`"), e.to_string()))?;

        let stmt = PreparedStatement::new(name, sql, Some(Box::new(native)));
        handle.insert_prepared(stmt, cache_size);
        Ok(())
    }

    fn unprepare_stmt(&self, handle: &mut DatabaseHandle, name: &str) -> Result<(), Error> {
        handle.remove_prepared(name);
        Ok(())
    }

    fn begin_tx(&self, handle: &mut DatabaseHandle, isolation: IsolationLevel) -> Result<Transaction, Error> {
        let client = self.client_mut(handle)?;
        client
            .simple_query("BEGIN")
            .map_err(|e| Error::new("failed to begin transaction", e.to_string()))?;
        Ok(Transaction::new(isolation))
    }

    fn commit_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("commit_tx")));
        }
        let client = self.client_mut(handle)?;
        client
            .simple_query("COMMIT")
            .map_err(|e| Error::new("failed to commit transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn rollback_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("rollback_tx")));
        }
        let client = self.client_mut(handle)?;
        client
            .simple_query("ROLLBACK")
            .map_err(|e| Error::new("failed to rollback transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn validate_conn_string(&self, input: &str) -> bool {
        input.starts_with("postgresql://")
    }

    fn escape_string(&self, handle: &DatabaseHandle, input: &str) -> Option<String> {
        if handle.engine_type != EngineTag::Postgresql {
            return None;
        }
        Some(input.replace('\'', "''"))
    }
}
