//! Database-access core of the service daemon: engine dispatch, connection
//! handles, migrations, and per-database queues (see `SPEC_FULL.md`).
//!
//! This crate is a library consumed by a thin daemon binary (`src/main.rs`);
//! it owns no HTTP/WS/mDNS/SMTP surface and no configuration loader of its
//! own beyond the process-wide tunables in [`config`].

pub mod config;
pub mod db;
pub mod error;
pub mod util;

/// Builds and installs the process-wide logger. Safe to call once at
/// startup; a second call would panic on `fern`'s global dispatch, so
/// `main` is the only caller.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<(), fern::InitError> {
    let level = level.parse().unwrap_or(log::LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    // `reopen-1` lets an operator rotate the log file out from under us
    // without a restart; we don't wire a signal here, just the sink itself.
    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_reopen(&std::path::PathBuf::from(path), None)?);
    }

    dispatch.apply()?;
    Ok(())
}
