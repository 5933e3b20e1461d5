//! Connection pools for target instances.
//!
//! `PoolManager` is constructed by the caller and passed to the engine; it
//! owns one deadpool-postgres pool per (instance, database) and one MongoDB
//! client per instance. Pools are opened lazily on first use and closed
//! together by `close()`.
//!
//! Each pool remembers a fingerprint of the connection settings it was built
//! from. A request for the same instance with a different host, port, user,
//! password or URI replaces the pool. Pools left unused for
//! `PoolSettings::idle_timeout` are closed on the next request.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use mongodb::options::{ClientOptions, Credential};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::PoolSettings;
use crate::error::GateError;
use crate::models::{DatabaseType, InstanceConnectionInfo, PoolStatus};

/// A pool of PostgreSQL connections to one database of one instance.
pub struct PostgresPool {
    instance_id: Uuid,
    database: String,
    display_url: String,
    pool: Pool,
    fingerprint: u64,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl PostgresPool {
    /// Build a pool. No connection is made until the first `get`.
    pub fn new(
        info: &InstanceConnectionInfo,
        database: &str,
        settings: &PoolSettings,
    ) -> Result<Self, GateError> {
        info.validate(DatabaseType::Postgresql)?;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&info.host);
        pg_config.port(info.effective_port(DatabaseType::Postgresql));
        pg_config.dbname(database);
        if let Some(user) = &info.username {
            pg_config.user(user);
        }
        if let Some(password) = &info.password {
            pg_config.password(password);
        }
        pg_config.application_name(&settings.application_name);
        pg_config.connect_timeout(settings.connect_timeout());
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(settings.max_size)
            .wait_timeout(Some(settings.wait_timeout()))
            .create_timeout(Some(settings.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| GateError::internal(format!("Failed to create pool: {e}")))?;

        let display_url = format!(
            "postgresql://{}{}:{}/{}",
            info.username.as_deref().map(|u| format!("{u}@")).unwrap_or_default(),
            info.host,
            info.effective_port(DatabaseType::Postgresql),
            database
        );
        tracing::info!(instance_id = %info.id, url = %display_url, "PostgreSQL pool created");

        Ok(Self {
            instance_id: info.id,
            database: database.to_string(),
            display_url,
            pool,
            fingerprint: credentials_fingerprint(info),
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Connection URL without password, safe to log.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire a connection, waiting up to the pool's wait timeout.
    pub async fn get(&self) -> Result<PooledConnection, GateError> {
        self.touch();
        let client = self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(err) => GateError::from(err),
            PoolError::Timeout(_) => {
                let status = self.status();
                if status.waiting > 0 || status.available <= 0 {
                    GateError::pool_timeout("Connection pool exhausted", status.waiting)
                } else {
                    GateError::connection("Timed out connecting to the database")
                }
            }
            PoolError::Closed => GateError::connection("Connection pool is closed"),
            other => GateError::connection(format!("Failed to acquire connection: {other}")),
        })?;

        Ok(PooledConnection { client, instance_id: self.instance_id })
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available as isize,
            waiting: status.waiting,
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// No connection checked out or awaited, and unused for at least `idle`.
    fn is_idle(&self, idle: Duration) -> bool {
        let status = self.pool.status();
        status.available as usize == status.size
            && status.waiting == 0
            && self.last_used.lock().elapsed() >= idle
    }

    pub fn close(&self) {
        self.pool.close();
        tracing::info!(instance_id = %self.instance_id, database = %self.database, "PostgreSQL pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// A connection checked out of a `PostgresPool`.
///
/// Returns to the pool when dropped, unless detached.
pub struct PooledConnection {
    client: deadpool_postgres::Client,
    instance_id: Uuid,
}

impl PooledConnection {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Run one or more statements with the simple query protocol, yielding
    /// messages as the server sends them.
    pub async fn simple_query_raw(&self, sql: &str) -> Result<tokio_postgres::SimpleQueryStream, GateError> {
        self.client.simple_query_raw(sql).await.map_err(GateError::from)
    }

    /// Run statements that return no rows.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), GateError> {
        self.client.batch_execute(sql).await.map_err(GateError::from)
    }

    /// Token for cancelling the running query from another task.
    pub fn cancel_token(&self) -> tokio_postgres::CancelToken {
        self.client.cancel_token()
    }

    /// Remove the connection from the pool so it is closed instead of reused.
    pub fn detach(self) {
        drop(deadpool_postgres::Object::take(self.client));
        tracing::debug!(instance_id = %self.instance_id, "Connection detached from pool");
    }
}

/// Pool status for one open PostgreSQL pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePoolStatus {
    pub instance_id: Uuid,
    pub database: String,
    pub status: PoolStatus,
}

type PoolKey = (Uuid, String);

/// Hash of everything that decides where and as whom a pool connects.
///
/// Kept in memory only, to notice changed settings for a known instance.
fn credentials_fingerprint(info: &InstanceConnectionInfo) -> u64 {
    let mut hasher = DefaultHasher::new();
    (&info.host, info.port, &info.username, &info.password, &info.uri).hash(&mut hasher);
    hasher.finish()
}

struct MongoEntry {
    client: mongodb::Client,
    fingerprint: u64,
    last_used: Mutex<Instant>,
}

impl MongoEntry {
    fn new(client: mongodb::Client, fingerprint: u64) -> Self {
        Self { client, fingerprint, last_used: Mutex::new(Instant::now()) }
    }

    fn checkout(&self) -> mongodb::Client {
        *self.last_used.lock() = Instant::now();
        self.client.clone()
    }

    fn is_idle(&self, idle: Duration) -> bool {
        self.last_used.lock().elapsed() >= idle
    }
}

/// Owner of all connection pools to target instances.
pub struct PoolManager {
    settings: PoolSettings,
    postgres: RwLock<HashMap<PoolKey, Arc<PostgresPool>>>,
    mongo: RwLock<HashMap<Uuid, MongoEntry>>,
    closed: AtomicBool,
}

impl PoolManager {
    /// Open an empty manager; pools are created on first use.
    pub fn open(settings: PoolSettings) -> Self {
        Self {
            settings,
            postgres: RwLock::new(HashMap::new()),
            mongo: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), GateError> {
        if self.is_closed() {
            return Err(GateError::connection("Pool manager is closed"));
        }
        Ok(())
    }

    /// Pool for `database` on a PostgreSQL instance, created if needed.
    pub fn postgres(
        &self,
        info: &InstanceConnectionInfo,
        database: &str,
    ) -> Result<Arc<PostgresPool>, GateError> {
        self.ensure_open()?;
        self.evict_idle();
        let key = (info.id, database.to_string());
        let fingerprint = credentials_fingerprint(info);
        if let Some(pool) = self.postgres.read().get(&key).filter(|p| p.fingerprint == fingerprint) {
            pool.touch();
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.postgres.write();
        if let Some(pool) = pools.get(&key).filter(|p| p.fingerprint == fingerprint) {
            pool.touch();
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(PostgresPool::new(info, database, &self.settings)?);
        let stale = pools.insert(key, Arc::clone(&pool));
        drop(pools);
        if let Some(stale) = stale {
            tracing::info!(instance_id = %info.id, database = %database, "Connection settings changed, replacing pool");
            stale.close();
        }
        Ok(pool)
    }

    /// MongoDB client for an instance, created if needed.
    pub async fn mongo(&self, info: &InstanceConnectionInfo) -> Result<mongodb::Client, GateError> {
        self.ensure_open()?;
        self.evict_idle();
        let fingerprint = credentials_fingerprint(info);
        if let Some(entry) = self.mongo.read().get(&info.id).filter(|e| e.fingerprint == fingerprint) {
            return Ok(entry.checkout());
        }

        info.validate(DatabaseType::Mongodb)?;
        let mut options = ClientOptions::parse(info.mongo_uri()).await?;
        options.app_name = Some(self.settings.application_name.clone());
        options.max_pool_size = Some(self.settings.max_size as u32);
        options.connect_timeout = Some(self.settings.connect_timeout());
        options.server_selection_timeout = Some(self.settings.wait_timeout());
        if info.uri.is_none() {
            if let Some(username) = &info.username {
                options.credential = Some(
                    Credential::builder()
                        .username(username.clone())
                        .password(info.password.clone())
                        .build(),
                );
            }
        }
        let client = mongodb::Client::with_options(options)?;

        let mut clients = self.mongo.write();
        if let Some(entry) = clients.get(&info.id).filter(|e| e.fingerprint == fingerprint) {
            // Another request created it meanwhile.
            return Ok(entry.checkout());
        }
        let replaced = clients.insert(info.id, MongoEntry::new(client.clone(), fingerprint)).is_some();
        drop(clients);
        if replaced {
            tracing::info!(instance_id = %info.id, "Connection settings changed, replacing MongoDB client");
        }
        tracing::info!(
            instance_id = %info.id,
            url = %info.display_url(DatabaseType::Mongodb),
            "MongoDB client created"
        );
        Ok(client)
    }

    /// Close pools unused for longer than the configured idle timeout and
    /// return how many were removed. A zero timeout disables eviction.
    ///
    /// PostgreSQL pools with a connection checked out are kept. Evicted
    /// MongoDB clients are dropped rather than shut down, since a running
    /// command may still hold a clone.
    pub fn evict_idle(&self) -> usize {
        let idle = self.settings.idle_timeout();
        if idle.is_zero() {
            return 0;
        }
        self.evict_idle_after(idle)
    }

    fn evict_idle_after(&self, idle: Duration) -> usize {
        let any_idle = self.postgres.read().values().any(|p| p.is_idle(idle))
            || self.mongo.read().values().any(|e| e.is_idle(idle));
        if !any_idle {
            return 0;
        }

        let evicted: Vec<Arc<PostgresPool>> = {
            let mut pools = self.postgres.write();
            let keys: Vec<PoolKey> =
                pools.iter().filter(|(_, pool)| pool.is_idle(idle)).map(|(key, _)| key.clone()).collect();
            keys.iter().filter_map(|key| pools.remove(key)).collect()
        };
        for pool in &evicted {
            pool.close();
        }

        let clients_evicted = {
            let mut clients = self.mongo.write();
            let before = clients.len();
            clients.retain(|_, entry| !entry.is_idle(idle));
            before - clients.len()
        };

        let total = evicted.len() + clients_evicted;
        if total > 0 {
            tracing::debug!(postgres = evicted.len(), mongo = clients_evicted, "Evicted idle pools");
        }
        total
    }

    /// Status of every open PostgreSQL pool.
    pub fn status(&self) -> Vec<InstancePoolStatus> {
        self.postgres
            .read()
            .iter()
            .map(|((instance_id, database), pool)| InstancePoolStatus {
                instance_id: *instance_id,
                database: database.clone(),
                status: pool.status(),
            })
            .collect()
    }

    /// Number of open pools and clients.
    pub fn len(&self) -> usize {
        self.postgres.read().len() + self.mongo.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget the pools of one instance.
    pub async fn remove(&self, instance_id: Uuid) {
        let removed: Vec<Arc<PostgresPool>> = {
            let mut pools = self.postgres.write();
            let keys: Vec<PoolKey> =
                pools.keys().filter(|(id, _)| *id == instance_id).cloned().collect();
            keys.iter().filter_map(|key| pools.remove(key)).collect()
        };
        for pool in removed {
            pool.close();
        }
        let entry = self.mongo.write().remove(&instance_id);
        if let Some(entry) = entry {
            entry.client.shutdown().await;
        }
    }

    /// Close every pool. Later requests fail with a connection error.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<Arc<PostgresPool>> = self.postgres.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
        let clients: Vec<mongodb::Client> = self.mongo.write().drain().map(|(_, e)| e.client).collect();
        for client in clients {
            client.shutdown().await;
        }
        tracing::info!("All connection pools closed");
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("postgres_pools", &self.postgres.read().len())
            .field("mongo_clients", &self.mongo.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
