//! Concrete [`crate::db::engine::Driver`] implementations, one per backend.
//! Each module is compiled only when its Cargo feature (and the matching
//! `cfg` emitted by `build.rs`) is active, so a binary built without, say,
//! the `db2` feature doesn't even link against `odbc-api`.

#[cfg(postgresql)]
pub mod postgresql;

#[cfg(mysql)]
pub mod mysql;

#[cfg(sqlite)]
pub mod sqlite;

#[cfg(db2)]
pub mod db2;

use std::sync::Arc;

use crate::db::engine::engine_register;
use crate::error::Error;

/// Registers every driver this binary was built with. Called once at
/// startup; unknown/unbuilt engines are simply absent from the registry, so
/// `engine_connect` against them fails with `NotRegistered` rather than a
/// missing-symbol crash (spec §9 "graceful unavailability").
pub fn register_compiled_drivers() -> Result<(), Error> {
    #[cfg(postgresql)]
    engine_register(Arc::new(postgresql::PostgresqlDriver::new()))?;

    #[cfg(mysql)]
    engine_register(Arc::new(mysql::MysqlDriver::new()))?;

    #[cfg(sqlite)]
    engine_register(Arc::new(sqlite::SqliteDriver::new()))?;

    #[cfg(db2)]
    engine_register(Arc::new(db2::Db2Driver::new()))?;

    Ok(())
}
