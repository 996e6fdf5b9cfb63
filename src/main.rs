use std::collections::HashMap;

use dbcore::config::config;
use dbcore::db::drivers::register_compiled_drivers;
use dbcore::db::engine::engine_init;
use dbcore::db::health::{database_health_check, database_subsystem_init, database_subsystem_shutdown};
use dbcore::db::queue::{self, ChildQueueType, DatabaseConfig};
use dbcore::util::{get_env, get_env_bool};

/// Reads the one database this daemon is configured against from the
/// environment, mirroring vaultwarden's `DATABASE_URL` convention. A real
/// deployment supplies many databases through the external configuration
/// loader (spec §6.1); this is the minimal standalone entry point.
fn database_config_from_env() -> DatabaseConfig {
    let mut queue_type_counts = HashMap::new();
    queue_type_counts.insert(ChildQueueType::Fast, get_env("FAST_QUEUE_WORKERS").unwrap_or(4));
    queue_type_counts.insert(ChildQueueType::Slow, get_env("SLOW_QUEUE_WORKERS").unwrap_or(1));

    DatabaseConfig {
        name: get_env("DATABASE_NAME").unwrap_or_else(|| String::from("primary")),
        connection_string: get_env("DATABASE_URL").or_else(|| Some(String::from("data/db.sqlite3"))),
        migrations: get_env("MIGRATIONS_DIR"),
        auto_migration: get_env_bool("AUTO_MIGRATION").unwrap_or(true),
        prepared_statement_cache_size: get_env("PREPARED_STATEMENT_CACHE_SIZE").unwrap_or(0),
        queue_type_counts: Some(queue_type_counts),
    }
}

fn main() {
    let cfg = config();
    if let Err(e) = dbcore::init_logging(&cfg.log_level, cfg.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    log::info!(target: "dbcore::main", "starting database core daemon");

    engine_init();
    if let Err(e) = register_compiled_drivers() {
        log::error!(target: "dbcore::main", "failed to register drivers: {e}");
        std::process::exit(1);
    }
    database_subsystem_init();

    let max_databases = get_env("MAX_DATABASES").unwrap_or(16);
    queue::system_init(max_databases);
    let manager = queue::manager().expect("system_init just created it");

    let db_config = database_config_from_env();
    let max_child_queues = get_env("MAX_CHILD_QUEUES").unwrap_or(8);
    let lead = match queue::DatabaseQueue::create_lead(&db_config, max_child_queues) {
        Ok(q) => q,
        Err(e) => {
            log::error!(target: "dbcore::main", "failed to configure database `{}`: {e}", db_config.name);
            std::process::exit(1);
        }
    };

    if let Err(e) = lead.lead_establish_connection() {
        log::error!(target: "dbcore::main", "failed to connect to database `{}`: {e}", db_config.name);
        std::process::exit(1);
    }

    if let Some(counts) = &db_config.queue_type_counts {
        for (queue_type, count) in counts {
            for _ in 0..*count {
                if let Err(e) = lead.spawn_child_queue(*queue_type) {
                    log::warn!(target: "dbcore::main", "could not spawn a `{queue_type}` worker for `{}`: {e}", db_config.name);
                }
            }
        }
    }

    let database_name = db_config.name.clone();
    if let Err(e) = manager.register_database(lead) {
        log::error!(target: "dbcore::main", "failed to register database `{database_name}`: {e}");
        std::process::exit(1);
    }

    log::info!(target: "dbcore::main", "database core ready (health={})", database_health_check());

    wait_for_shutdown_signal();

    log::info!(target: "dbcore::main", "shutting down");
    manager.shutdown_all();
    database_subsystem_shutdown();
}

/// Blocks until Ctrl+C or SIGTERM, then returns so `main` can drain queues
/// and disconnect before the process exits.
fn wait_for_shutdown_signal() {
    let (tx, rx) = std::sync::mpsc::channel();
    let result = ctrlc::set_handler(move || {
        let _ = tx.send(());
    });
    if let Err(e) = result {
        log::warn!(target: "dbcore::main", "could not install shutdown signal handler: {e}");
        return;
    }
    let _ = rx.recv();
}
