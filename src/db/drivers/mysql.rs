//! MySQL adapter, grounded on the `mysql` crate's blocking `Pool`/`Conn`.
//!
//! Like PostgreSQL, `mysql::Statement` is an owned handle independent of the
//! `Conn` borrow, so prepared statements store the real native object.

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, Row as MyRow, Statement as MyStatement, Value as MyValue};

use crate::db::connection_config::ConnectionConfig;
use crate::db::engine::{Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, IsolationLevel, PreparedStatement, QueryRequest, QueryResult, Status, Transaction};
use crate::db::json::{rows_to_json_array, CellValue};
use crate::error::Error;

pub struct MysqlDriver {
    available: bool,
}

impl MysqlDriver {
    pub fn new() -> Self {
        MysqlDriver { available: true }
    }

    fn conn_mut<'a>(&self, handle: &'a mut DatabaseHandle) -> Result<&'a mut Conn, Error> {
        if handle.engine_type != EngineTag::Mysql {
            return Err(Error::InvalidArgument(
                format!("handle engine_type is {}, not mysql", handle.engine_type),
                String::from("MysqlDriver"),
            ));
        }
        handle
            .connection_handle
            .as_mut()
            .and_then(|h| h.downcast_mut::<Conn>())
            .ok_or_else(|| Error::InvalidArgument(String::from("handle has no mysql connection"), String::from("MysqlDriver")))
    }

    fn convert_value(value: &MyValue) -> CellValue {
        match value {
            MyValue::NULL => CellValue::Null,
            MyValue::Int(i) => CellValue::Numeric(i.to_string()),
            MyValue::UInt(i) => CellValue::Numeric(i.to_string()),
            MyValue::Float(f) => CellValue::Numeric(f.to_string()),
            MyValue::Double(f) => CellValue::Numeric(f.to_string()),
            MyValue::Bytes(b) => CellValue::Text(String::from_utf8_lossy(b).into_owned()),
            other => CellValue::Text(format!("{other:?}")),
        }
    }

    fn convert_row(row: &MyRow) -> Vec<CellValue> {
        (0..row.len()).map(|i| row.as_ref(i).map(Self::convert_value).unwrap_or(CellValue::Null)).collect()
    }

    fn column_names(row: &MyRow) -> Vec<String> {
        row.columns_ref().iter().map(|c| c.name_str().into_owned()).collect()
    }

    fn run_query(conn: &mut Conn, sql: &str) -> QueryResult {
        match conn.query_iter(sql) {
            Ok(result) => {
                let affected_rows = result.affected_rows();
                match result.collect::<Result<Vec<MyRow>, _>>() {
                    Ok(rows) => {
                        let columns = rows.first().map(Self::column_names).unwrap_or_default();
                        let data: Vec<Vec<CellValue>> = rows.iter().map(Self::convert_row).collect();
                        QueryResult {
                            success: true,
                            row_count: data.len(),
                            column_count: columns.len(),
                            affected_rows,
                            data_json: rows_to_json_array(&columns, &data),
                            column_names: columns,
                            error_message: None,
                        }
                    }
                    Err(e) => QueryResult::failure(e.to_string()),
                }
            }
            Err(e) => QueryResult::failure(e.to_string()),
        }
    }
}

impl Driver for MysqlDriver {
    fn engine_type(&self) -> EngineTag {
        EngineTag::Mysql
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
        let opts = Opts::from_url(&config.connection_string)
            .map_err(|e| Error::connection_failed(format!("invalid mysql connection string: {e}")))?;
        let conn = Conn::new(opts).map_err(|e| Error::connection_failed(format!("mysql connect failed: {e}")))?;

        let mut handle = DatabaseHandle::new(EngineTag::Mysql, config.clone(), designator.map(str::to_string), Status::Connected);
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
        conn.query_drop("SELECT 1").is_ok()
    }

    fn execute_query(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> Result<QueryResult, Error> {
        let conn = self.conn_mut(handle)?;
        Ok(Self::run_query(conn, &request.sql_template))
    }

    fn execute_prepared(&self, handle: &mut DatabaseHandle, stmt: &PreparedStatement, _request: &QueryRequest) -> Result<QueryResult, Error> {
        if stmt.engine_specific_handle.is_none() {
            return Ok(QueryResult::empty_success());
        }
        let conn = self.conn_mut(handle)?;
        Ok(Self::run_query(conn, &stmt.sql_template))
    }

    fn prepare_stmt(&self, handle: &mut DatabaseHandle, name: &str, sql: &str) -> Result<(), Error> {
        let cache_size = handle.config.prepared_statement_cache_size.max(1) as usize;
        let conn = self.conn_mut(handle)?;
        let native: MyStatement = conn
            .prep(sql)
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
        let conn = self.conn_mut(handle)?;
        conn.query_drop("START TRANSACTION")
            .map_err(|e| Error::new("failed to begin transaction", e.to_string()))?;
        Ok(Transaction::new(isolation))
    }

    fn commit_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("commit_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.query_drop("COMMIT")
            .map_err(|e| Error::new("failed to commit transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn rollback_tx(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
        if handle.current_transaction.is_none() {
            return Err(Error::TransactionMismatch(String::from("no active transaction on handle"), String::from("rollback_tx")));
        }
        let conn = self.conn_mut(handle)?;
        conn.query_drop("ROLLBACK")
            .map_err(|e| Error::new("failed to rollback transaction", e.to_string()))?;
        handle.current_transaction = None;
        Ok(())
    }

    fn validate_conn_string(&self, input: &str) -> bool {
        input.starts_with("mysql://")
    }

    fn escape_string(&self, handle: &DatabaseHandle, input: &str) -> Option<String> {
        if handle.engine_type != EngineTag::Mysql {
            return None;
        }
        Some(input.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}
