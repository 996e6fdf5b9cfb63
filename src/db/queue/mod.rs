//! Per-database lead + child queues, worker threads, and statistics — spec §4.5, §5.
//!
//! Each configured database gets one [`DatabaseQueue`]: a lead queue that
//! owns the persistent connection and drives migrations, plus zero or more
//! child queues, each backed by a dedicated blocking worker thread reading
//! off an `mpsc` channel in FIFO order. Each worker holds exclusive use of
//! its own connection for its lifetime rather than checking one in and out
//! of a shared pool, since a queue's whole point is serializing access to a
//! single connection anyway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use derive_more::Display;

use crate::config::config as app_config;
use crate::db::connection_config::{infer_engine_tag, parse_connection_string, ConnectionConfig};
use crate::db::engine::{driver_for, Driver, EngineTag};
use crate::db::handle::{DatabaseHandle, QueryRequest, QueryResult};
use crate::db::migration::{self, BootstrapCounters, PayloadFile, QueryCache};
use crate::error::Error;
use crate::util::retry_db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ChildQueueType {
    #[display("slow")]
    Slow,
    #[display("medium")]
    Medium,
    #[display("fast")]
    Fast,
    #[display("cache")]
    Cache,
    #[display("batch")]
    Batch,
}

/// External per-database configuration (spec §6.1), supplied by the config
/// loader this crate receives by reference rather than owns.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub name: String,
    pub connection_string: Option<String>,
    pub migrations: Option<String>,
    pub auto_migration: bool,
    pub prepared_statement_cache_size: u32,
    pub queue_type_counts: Option<HashMap<ChildQueueType, u32>>,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub submitted: AtomicU64,
    pub failed: AtomicU64,
    pub last_used: AtomicU64,
}

#[derive(Debug, Default)]
pub struct DqmStats {
    pub total_timeouts: AtomicU64,
    pub total_queries_submitted: AtomicU64,
    pub total_queries_failed: AtomicU64,
}

struct QueuedRequest {
    request: QueryRequest,
    enqueued_at: Instant,
    reply: mpsc::Sender<QueryResult>,
}

struct ChildQueueHandle {
    queue_type: ChildQueueType,
    queue_number: u32,
    sender: mpsc::Sender<QueuedRequest>,
    join_handle: Option<JoinHandle<()>>,
    stats: Arc<QueueStats>,
}

struct LeadQueueState {
    persistent_connection: Option<DatabaseHandle>,
    query_cache: QueryCache,
    counters: BootstrapCounters,
}

/// One configured database: a lead queue plus its child worker queues.
pub struct DatabaseQueue {
    pub database_name: String,
    pub connection_string: String,
    pub engine_type: EngineTag,
    config: Arc<ConnectionConfig>,
    auto_migration: bool,
    migrations_dir: Option<String>,
    lead: Mutex<LeadQueueState>,
    children: RwLock<Vec<ChildQueueHandle>>,
    max_child_queues: usize,
    stats: Arc<DqmStats>,
    shutdown: Arc<AtomicBool>,
}

fn now_unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl DatabaseQueue {
    /// Builds a queue with `is_lead_queue = true` conceptually — the lead
    /// state lives directly on `DatabaseQueue` rather than as a separate
    /// struct, since exactly one exists per database (spec §3.1 invariant).
    pub fn create_lead(db_config: &DatabaseConfig, max_child_queues: usize) -> Result<Arc<DatabaseQueue>, Error> {
        let connection_string = db_config.connection_string.clone().ok_or_else(|| {
            Error::InvalidArgument(String::from("database config has no connection_string"), String::from("create_lead"))
        })?;
        let parsed = parse_connection_string(&connection_string)
            .ok_or_else(|| Error::InvalidArgument(String::from("connection string failed to parse"), String::from("create_lead")))?;
        let mut parsed = parsed;
        if db_config.prepared_statement_cache_size > 0 {
            parsed.prepared_statement_cache_size = db_config.prepared_statement_cache_size;
        }
        let engine_type = infer_engine_tag(&connection_string);

        Ok(Arc::new(DatabaseQueue {
            database_name: db_config.name.clone(),
            connection_string,
            engine_type,
            config: Arc::new(parsed),
            auto_migration: db_config.auto_migration,
            migrations_dir: db_config.migrations.clone(),
            lead: Mutex::new(LeadQueueState {
                persistent_connection: None,
                query_cache: QueryCache::new(),
                counters: BootstrapCounters::default(),
            }),
            children: RwLock::new(Vec::new()),
            max_child_queues,
            stats: Arc::new(DqmStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn driver(&self) -> Result<Arc<dyn Driver>, Error> {
        driver_for(self.engine_type)
            .ok_or_else(|| Error::NotRegistered(format!("no driver registered for {}", self.engine_type), String::from("DatabaseQueue")))
    }

    /// Lazily establishes the lead's persistent connection, retrying per
    /// `Config::db_connection_retries`.
    pub fn lead_establish_connection(&self) -> Result<(), Error> {
        let driver = self.driver()?;
        let mut lead = self.lead.lock().expect("lead queue mutex poisoned");
        if lead.persistent_connection.is_some() {
            return Ok(());
        }
        let retries = app_config().db_connection_retries;
        let designator = format!("{}::lead", self.database_name);
        let handle = retry_db(|| driver.connect(&self.config, Some(&designator)), retries)?;
        lead.persistent_connection = Some(handle);
        Ok(())
    }

    /// Runs the bootstrap query and, if `auto_migration` is on, the forward
    /// migration loop (spec §4.6.1, §4.6.2). `bootstrap_sql` and `payload`
    /// come from the external migration source; `script_name_for_ordinal`
    /// maps a migration ordinal to the name under which its script is
    /// stored in `payload`.
    pub fn lead_run_migration(
        &self,
        bootstrap_sql: &str,
        payload: &[PayloadFile],
        script_name_for_ordinal: impl Fn(i64) -> String,
    ) -> Result<BootstrapCounters, Error> {
        self.lead_establish_connection()?;
        let driver = self.driver()?;
        let mut lead = self.lead.lock().expect("lead queue mutex poisoned");
        let handle = lead
            .persistent_connection
            .as_mut()
            .expect("lead_establish_connection just ensured this is Some");

        let started = Instant::now();
        let counters = migration::run_bootstrap_query(driver.as_ref(), handle, bootstrap_sql)?;
        let counters = migration::run_forward_migrations(
            driver.as_ref(),
            handle,
            self.auto_migration,
            bootstrap_sql,
            payload,
            counters,
            script_name_for_ordinal,
        )?;
        log::info!(
            target: "dbcore::migration",
            "migration pass for `{}` finished in {:?} (applied={})",
            self.database_name,
            started.elapsed(),
            counters.latest_applied_migration
        );
        lead.counters = counters;
        Ok(counters)
    }

    /// Reverse-migration test process (spec §4.6.3).
    pub fn lead_execute_migration_test_process(&self, bootstrap_sql: &str) -> Result<BootstrapCounters, Error> {
        self.lead_establish_connection()?;
        let driver = self.driver()?;
        let mut lead = self.lead.lock().expect("lead queue mutex poisoned");
        let handle = lead
            .persistent_connection
            .as_mut()
            .expect("lead_establish_connection just ensured this is Some");

        let counters = lead.counters;
        let counters = migration::run_reverse_migrations(driver.as_ref(), handle, bootstrap_sql, &lead.query_cache, counters)?;
        lead.counters = counters;
        Ok(counters)
    }

    pub fn load_query_cache_entry(&self, entry: migration::QueryCacheEntry) {
        let mut lead = self.lead.lock().expect("lead queue mutex poisoned");
        lead.query_cache.insert(entry);
    }

    /// Discovers migration files on disk, when this database is configured
    /// with a `migrations` directory rather than an in-memory payload table
    /// (spec §4.6.6).
    pub fn discover_migration_files(&self) -> Result<Vec<String>, Error> {
        let dir = self
            .migrations_dir
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument(String::from("database has no migrations directory configured"), String::from("discover_migration_files")))?;
        migration::discover_path_migration_files(dir, &self.database_name)
    }

    /// Spawns a worker thread for a new child queue of the given type.
    /// Rejects the call once `max_child_queues` children already exist.
    pub fn spawn_child_queue(&self, queue_type: ChildQueueType) -> Result<(), Error> {
        let mut children = self.children.write().expect("children lock poisoned");
        if children.len() >= self.max_child_queues {
            return Err(Error::InvalidArgument(
                format!("database `{}` is already at its max_child_queues limit", self.database_name),
                String::from("spawn_child_queue"),
            ));
        }

        let driver = self.driver()?;
        let (sender, receiver) = mpsc::channel::<QueuedRequest>();
        let stats = Arc::new(QueueStats::default());
        let dqm_stats = Arc::clone(&self.stats);
        let shutdown = Arc::clone(&self.shutdown);
        let conn_config = Arc::clone(&self.config);
        let queue_number = children.len() as u32;
        let label = format!("{}::{queue_type}::{queue_number}", self.database_name);
        let worker_stats = Arc::clone(&stats);

        let join_handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || run_child_worker(driver, conn_config, receiver, worker_stats, dqm_stats, shutdown, label))
            .map_err(|e| Error::new("failed to spawn worker thread", e.to_string()))?;

        children.push(ChildQueueHandle {
            queue_type,
            queue_number,
            sender,
            join_handle: Some(join_handle),
            stats,
        });
        Ok(())
    }

    /// Submits a request to the first child queue of the given type,
    /// FIFO per queue (spec §5). Blocks the calling thread until the
    /// worker replies.
    pub fn submit(&self, queue_type: ChildQueueType, request: QueryRequest) -> Result<QueryResult, Error> {
        let children = self.children.read().expect("children lock poisoned");
        let child = children
            .iter()
            .find(|c| c.queue_type == queue_type)
            .ok_or_else(|| Error::InvalidArgument(format!("no `{queue_type}` queue on database `{}`", self.database_name), String::from("submit")))?;

        let (reply_tx, reply_rx) = mpsc::channel();
        child
            .sender
            .send(QueuedRequest {
                request,
                enqueued_at: Instant::now(),
                reply: reply_tx,
            })
            .map_err(|_| Error::InvalidArgument(String::from("worker thread for this queue has exited"), String::from("submit")))?;

        reply_rx
            .recv()
            .map_err(|_| Error::InvalidArgument(String::from("worker thread dropped the reply channel"), String::from("submit")))
    }

    /// Parses and health-checks the queue's connection string directly,
    /// without disturbing the lead's persistent connection (spec §4.5
    /// "Connection check").
    pub fn check_connection(&self) -> bool {
        let Some(config) = parse_connection_string(&self.connection_string) else {
            return false;
        };
        let Ok(driver) = self.driver() else {
            return false;
        };
        match driver.connect(&config, Some("health-check")) {
            Ok(mut handle) => {
                let ok = driver.health_check(&mut handle);
                let _ = driver.disconnect(&mut handle);
                ok
            }
            Err(_) => false,
        }
    }

    /// Tolerates an unknown child index; does nothing out of range. Returns
    /// `(queue_number, submitted, failed, last_used)`.
    pub fn per_queue_stats(&self, index: usize) -> Option<(u32, u64, u64, u64)> {
        let children = self.children.read().expect("children lock poisoned");
        children.get(index).map(|c| {
            (
                c.queue_number,
                c.stats.submitted.load(Ordering::SeqCst),
                c.stats.failed.load(Ordering::SeqCst),
                c.stats.last_used.load(Ordering::SeqCst),
            )
        })
    }

    pub fn dqm_stats(&self) -> (u64, u64, u64) {
        (
            self.stats.total_queries_submitted.load(Ordering::SeqCst),
            self.stats.total_queries_failed.load(Ordering::SeqCst),
            self.stats.total_timeouts.load(Ordering::SeqCst),
        )
    }

    /// Signals a child queue to drain in-flight requests, decline new ones,
    /// and exit; rejects an out-of-range `queue_type` silently (returns
    /// `false`) matching the null/invalid tolerance spec §4.5 asks for.
    pub fn shutdown_child_queue(&self, queue_type: ChildQueueType) -> bool {
        let mut children = self.children.write().expect("children lock poisoned");
        let Some(idx) = children.iter().position(|c| c.queue_type == queue_type) else {
            return false;
        };
        let ChildQueueHandle { sender, join_handle, .. } = children.swap_remove(idx);
        drop(sender);
        if let Some(handle) = join_handle {
            let _ = handle.join();
        }
        true
    }

    /// Drains all child queues and closes the lead connection. A repeat
    /// call is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let drain_deadline = Duration::from_secs(app_config().shutdown_drain_seconds);
        let started = Instant::now();

        let mut children = self.children.write().expect("children lock poisoned");
        for child in children.drain(..) {
            let ChildQueueHandle { sender, join_handle, .. } = child;
            drop(sender);
            if let Some(handle) = join_handle {
                let remaining = drain_deadline.saturating_sub(started.elapsed());
                // `JoinHandle` has no timed join; workers are expected to
                // drain well within `shutdown_drain_seconds` since they only
                // block on already-enqueued, already-connected work.
                let _ = remaining;
                let _ = handle.join();
            }
        }
        drop(children);

        if let Ok(driver) = self.driver() {
            let mut lead = self.lead.lock().expect("lead queue mutex poisoned");
            if let Some(mut handle) = lead.persistent_connection.take() {
                let _ = driver.disconnect(&mut handle);
            }
        }
    }
}

fn run_child_worker(
    driver: Arc<dyn Driver>,
    conn_config: Arc<ConnectionConfig>,
    receiver: mpsc::Receiver<QueuedRequest>,
    stats: Arc<QueueStats>,
    dqm_stats: Arc<DqmStats>,
    shutdown: Arc<AtomicBool>,
    label: String,
) {
    let retries = app_config().db_connection_retries;
    let mut handle = match retry_db(|| driver.connect(&conn_config, Some(&label)), retries) {
        Ok(h) => h,
        Err(e) => {
            log::error!(target: "dbcore::queue", "worker `{label}` could not establish a connection: {e}");
            return;
        }
    };

    for queued in receiver.iter() {
        let result = if shutdown.load(Ordering::SeqCst) {
            QueryResult::failure("queue is shutting down")
        } else if queued.request.timeout_ms > 0 && queued.enqueued_at.elapsed() > Duration::from_millis(u64::from(queued.request.timeout_ms)) {
            dqm_stats.total_timeouts.fetch_add(1, Ordering::SeqCst);
            QueryResult::failure("request timed out waiting in queue")
        } else {
            match driver.execute_query(&mut handle, &queued.request) {
                Ok(r) => r,
                Err(e) => QueryResult::failure(e.to_string()),
            }
        };

        stats.submitted.fetch_add(1, Ordering::SeqCst);
        stats.last_used.store(now_unix_seconds(), Ordering::SeqCst);
        dqm_stats.total_queries_submitted.fetch_add(1, Ordering::SeqCst);
        if !result.success {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            dqm_stats.total_queries_failed.fetch_add(1, Ordering::SeqCst);
        }

        let _ = queued.reply.send(result);
    }

    let _ = driver.disconnect(&mut handle);
}

/// Process-global manager over every configured database's queue (spec
/// §3.1 `DatabaseQueueManager`).
pub struct DatabaseQueueManager {
    databases: RwLock<Vec<Arc<DatabaseQueue>>>,
    max_databases: usize,
    initialized: AtomicBool,
}

static MANAGER: OnceLock<DatabaseQueueManager> = OnceLock::new();

/// Allocates the process-wide manager on first call; later calls return the
/// same instance regardless of the `max_databases` they pass (spec §4.5
/// "idempotent"). `max_databases = 0` is valid: the manager exists but
/// `register_database` always fails since no slot is ever available.
pub fn manager_create(max_databases: usize) -> &'static DatabaseQueueManager {
    MANAGER.get_or_init(|| DatabaseQueueManager {
        databases: RwLock::new(Vec::new()),
        max_databases,
        initialized: AtomicBool::new(false),
    })
}

/// Idempotent: a second call when already initialized is a no-op success.
pub fn system_init(max_databases: usize) {
    let manager = manager_create(max_databases);
    if !manager.initialized.swap(true, Ordering::SeqCst) {
        log::info!(target: "dbcore::queue", "queue manager initialized (max_databases={max_databases})");
    }
}

/// Returns the manager if [`system_init`]/[`manager_create`] has already run.
pub fn manager() -> Option<&'static DatabaseQueueManager> {
    MANAGER.get()
}

impl DatabaseQueueManager {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn register_database(&self, queue: Arc<DatabaseQueue>) -> Result<(), Error> {
        let mut databases = self.databases.write().expect("manager lock poisoned");
        if databases.len() >= self.max_databases {
            return Err(Error::InvalidArgument(
                format!("manager is at its max_databases limit ({})", self.max_databases),
                String::from("register_database"),
            ));
        }
        databases.push(queue);
        Ok(())
    }

    pub fn database(&self, name: &str) -> Option<Arc<DatabaseQueue>> {
        self.databases.read().expect("manager lock poisoned").iter().find(|d| d.database_name == name).cloned()
    }

    pub fn database_count(&self) -> usize {
        self.databases.read().expect("manager lock poisoned").len()
    }

    /// Shuts down every registered database's queue. Idempotent at the
    /// manager level via each `DatabaseQueue::shutdown`'s own guard.
    pub fn shutdown_all(&self) {
        let databases = self.databases.read().expect("manager lock poisoned");
        for database in databases.iter() {
            database.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::engine::{engine_init, engine_register, EngineTag as Tag};
    use crate::db::handle::{IsolationLevel, Status, Transaction};
    use std::sync::atomic::AtomicUsize;

    struct CountingDriver {
        connects: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn engine_type(&self) -> EngineTag {
            Tag::Sqlite
        }

        fn is_available(&self) -> bool {
            true
        }

        fn connect(&self, config: &ConnectionConfig, designator: Option<&str>) -> Result<DatabaseHandle, Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(DatabaseHandle::new(Tag::Sqlite, config.clone(), designator.map(str::to_string), Status::Connected))
        }

        fn disconnect(&self, handle: &mut DatabaseHandle) -> Result<(), Error> {
            handle.status = Status::Disconnected;
            Ok(())
        }

        fn health_check(&self, _handle: &mut DatabaseHandle) -> bool {
            true
        }

        fn execute_query(&self, _handle: &mut DatabaseHandle, _request: &QueryRequest) -> Result<QueryResult, Error> {
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

    fn ensure_sqlite_driver_registered() {
        engine_init();
        let _ = engine_register(Arc::new(CountingDriver { connects: AtomicUsize::new(0) }));
    }

    #[test]
    fn manager_create_with_zero_slots_rejects_registration() {
        let manager = manager_create(0);
        let db_config = DatabaseConfig {
            name: "t".to_string(),
            connection_string: Some(":memory:".to_string()),
            ..Default::default()
        };
        let queue = DatabaseQueue::create_lead(&db_config, 4).unwrap();
        assert!(manager.register_database(queue).is_err());
    }

    #[test]
    fn submit_without_a_matching_child_queue_fails() {
        ensure_sqlite_driver_registered();
        let db_config = DatabaseConfig {
            name: "submit-test".to_string(),
            connection_string: Some(":memory:".to_string()),
            ..Default::default()
        };
        let queue = DatabaseQueue::create_lead(&db_config, 4).unwrap();
        let result = queue.submit(ChildQueueType::Fast, QueryRequest::default());
        assert!(result.is_err());
    }

    #[test]
    fn spawn_child_queue_respects_max_child_queues() {
        ensure_sqlite_driver_registered();
        let db_config = DatabaseConfig {
            name: "spawn-test".to_string(),
            connection_string: Some(":memory:".to_string()),
            ..Default::default()
        };
        let queue = DatabaseQueue::create_lead(&db_config, 1).unwrap();
        queue.spawn_child_queue(ChildQueueType::Fast).unwrap();
        assert!(queue.spawn_child_queue(ChildQueueType::Slow).is_err());
        queue.shutdown();
    }
}
