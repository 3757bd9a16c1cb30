//! Connection pool manager for authenticated sessions to flaky remote
//! servers.
//!
//! Owns one pool per server key. Hides the cost and fragility of session
//! establishment behind acquire/release: borrowed connections are tagged,
//! validated by age/operation-count/transport state, and pools are renewed
//! proactively on error thresholds or a wall-clock timer: a fresh pool
//! takes over immediately while the outgoing one drains after a grace
//! period, so in-flight borrowers are never interrupted.
//!
//! The manager is an explicitly constructed instance with a documented
//! `start`/`shutdown` lifecycle, injected into callers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use crate::store::ConfigStore;
use crate::transport::{QueryResult, Transport};
use crate::value::SqlValue;

/// Pool tuning parameters.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connections opened eagerly when a pool initializes.
    pub min_size: usize,

    /// Maximum concurrently borrowed connections per pool.
    pub max_size: usize,

    /// How long `acquire` waits for a free slot.
    pub acquire_timeout: Duration,

    /// Idle connections older than this are evicted by the sweep.
    pub idle_timeout: Duration,

    /// Cadence of the maintenance sweep.
    pub eviction_interval: Duration,

    /// Connections older than this fail validation.
    pub max_connection_age: Duration,

    /// Connections that served more operations than this fail validation.
    pub max_operation_count: u32,

    /// Pools older than this are force-renewed regardless of error state.
    pub renew_interval: Duration,

    /// Grace period an outgoing pool keeps serving borrowers after renewal.
    pub renew_grace: Duration,

    /// Generic errors per key before proactive renewal.
    pub generic_error_threshold: u32,

    /// Config-store errors per key before proactive renewal.
    pub store_error_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(60),
            max_connection_age: Duration::from_secs(3600),
            max_operation_count: 500,
            renew_interval: Duration::from_secs(2 * 3600),
            renew_grace: Duration::from_secs(60),
            generic_error_threshold: 5,
            store_error_threshold: 3,
        }
    }
}

/// Classification of a health-tracked failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection/query failures against the remote server.
    Generic,

    /// Failures reaching the upstream configuration store.
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    Initializing,
    Ready,
    Renewing,
    Closed,
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    ops: u32,
    idle_since: Instant,
}

struct PoolInner<T: Transport> {
    phase: PoolPhase,
    idle: VecDeque<IdleConn<T::Conn>>,
}

/// One pool of connections to a single server.
struct ServerPool<T: Transport> {
    key: String,
    config: ServerConfig,
    created_at: Instant,
    semaphore: Arc<Semaphore>,
    borrowed: AtomicUsize,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Transport> ServerPool<T> {
    fn phase_blocking(&self) -> PoolPhase {
        // Used only from sync contexts that already hold no lock.
        match self.inner.try_lock() {
            Ok(inner) => inner.phase,
            Err(_) => PoolPhase::Ready,
        }
    }
}

/// Tag attached to every borrowed connection.
#[derive(Debug, Clone)]
pub struct ConnectionTag {
    /// Server key of the pool the connection came from.
    pub origin_key: String,

    /// When the current borrow started.
    pub acquired_at: Instant,

    /// Operations served during the current borrow.
    pub op_count: u32,
}

/// A borrowed connection, exclusively owned by the caller until released.
pub struct PooledConnection<T: Transport> {
    conn: Option<T::Conn>,
    transport: Arc<T>,
    pool: Arc<ServerPool<T>>,
    _permit: Option<OwnedSemaphorePermit>,
    tag: ConnectionTag,
    created_at: Instant,
    lifetime_ops: u32,
}

impl<T: Transport> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("tag", &self.tag)
            .field("created_at", &self.created_at)
            .field("lifetime_ops", &self.lifetime_ops)
            .finish()
    }
}

impl<T: Transport> PooledConnection<T> {
    /// The borrow tag.
    pub fn tag(&self) -> &ConnectionTag {
        &self.tag
    }

    /// Server key this connection belongs to.
    pub fn server_key(&self) -> &str {
        &self.tag.origin_key
    }

    /// Age of the underlying connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Lifetime operation count of the underlying connection.
    pub fn op_count(&self) -> u32 {
        self.lifetime_ops
    }

    fn conn_mut(&mut self) -> Result<&mut T::Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| TransferError::ConnectionLost("connection already released".into()))
    }

    /// Run a row-returning statement on this connection.
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let transport = self.transport.clone();
        let conn = self.conn_mut()?;
        let result = transport.query(conn, sql, params).await;
        self.tag.op_count += 1;
        self.lifetime_ops += 1;
        result
    }

    /// Run a write statement on this connection.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let transport = self.transport.clone();
        let conn = self.conn_mut()?;
        let result = transport.execute(conn, sql, params).await;
        self.tag.op_count += 1;
        self.lifetime_ops += 1;
        result
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.pool.borrowed.fetch_sub(1, Ordering::SeqCst);
        if self.conn.is_some() {
            // Dropped without release: the session dies with the value.
            debug!(key = %self.tag.origin_key, "borrowed connection dropped without release");
        }
    }
}

struct RetiredPool<T: Transport> {
    pool: Arc<ServerPool<T>>,
    drain_deadline: Instant,
}

#[derive(Debug, Default)]
struct HealthCounters {
    generic: u32,
    store: u32,
}

/// Manager owning one connection pool per remote server key.
pub struct ConnectionPoolManager<T: Transport> {
    transport: Arc<T>,
    config_store: Arc<dyn ConfigStore>,
    settings: PoolSettings,
    pools: Mutex<HashMap<String, Arc<ServerPool<T>>>>,
    retired: Mutex<Vec<RetiredPool<T>>>,
    health: Mutex<HashMap<String, HealthCounters>>,
    /// Serializes structural pool creation so concurrent first-use never
    /// creates two live pools for one key.
    init_lock: Mutex<()>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ConnectionPoolManager<T> {
    /// Create a manager with default settings.
    pub fn new(transport: Arc<T>, config_store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Self::with_settings(transport, config_store, PoolSettings::default())
    }

    /// Create a manager with explicit settings.
    pub fn with_settings(
        transport: Arc<T>,
        config_store: Arc<dyn ConfigStore>,
        settings: PoolSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config_store,
            settings,
            pools: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            health: Mutex::new(HashMap::new()),
            init_lock: Mutex::new(()),
            maintenance: Mutex::new(None),
        })
    }

    /// Start the background maintenance task: idle eviction, grace-period
    /// draining of retired pools, and wall-clock pool renewal.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.maintenance.lock().await;
        if guard.is_some() {
            return;
        }
        let manager = Arc::downgrade(self);
        let interval = self.settings.eviction_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_maintenance().await;
            }
        }));
    }

    /// Stop maintenance and close every pool. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }
        self.close_all_pools().await;
        let retired: Vec<_> = self.retired.lock().await.drain(..).collect();
        for entry in retired {
            self.close_pool_conns(&entry.pool).await;
        }
    }

    /// Initialize (or replace) the pool for a server key.
    ///
    /// Loads credentials from the config store and eagerly opens the
    /// minimum number of connections. Fails with `ConfigNotFound` when no
    /// credentials exist for the key.
    pub async fn init_pool(&self, server_key: &str) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        self.init_pool_locked(server_key).await.map(|_| ())
    }

    async fn init_pool_locked(&self, server_key: &str) -> Result<Arc<ServerPool<T>>> {
        let config = match self.config_store.server_config(server_key).await {
            Ok(config) => config,
            Err(e) => {
                // Counter only: the pool is already being (re)built here, so
                // threshold renewal would re-enter the init lock for nothing.
                self.bump_error(server_key, ErrorClass::Store).await;
                return Err(e);
            }
        };

        let pool = Arc::new(ServerPool {
            key: server_key.to_string(),
            config,
            created_at: Instant::now(),
            semaphore: Arc::new(Semaphore::new(self.settings.max_size)),
            borrowed: AtomicUsize::new(0),
            inner: Mutex::new(PoolInner {
                phase: PoolPhase::Initializing,
                idle: VecDeque::new(),
            }),
        });

        // Eagerly open the minimum connections so init failures surface
        // here instead of at first acquire.
        for _ in 0..self.settings.min_size {
            match self.transport.connect(&pool.config).await {
                Ok(conn) => {
                    let mut inner = pool.inner.lock().await;
                    inner.idle.push_back(IdleConn {
                        conn,
                        created_at: Instant::now(),
                        ops: 0,
                        idle_since: Instant::now(),
                    });
                }
                Err(e) => {
                    self.bump_error(server_key, ErrorClass::Generic).await;
                    self.close_pool_conns(&pool).await;
                    return Err(e);
                }
            }
        }

        pool.inner.lock().await.phase = PoolPhase::Ready;

        let replaced = {
            let mut pools = self.pools.lock().await;
            pools.insert(server_key.to_string(), pool.clone())
        };
        if let Some(old) = replaced {
            self.retire(old).await;
        }

        info!(key = server_key, "pool initialized");
        Ok(pool)
    }

    async fn pool_or_init(&self, server_key: &str) -> Result<Arc<ServerPool<T>>> {
        if let Some(pool) = self.pools.lock().await.get(server_key).cloned() {
            return Ok(pool);
        }
        let _guard = self.init_lock.lock().await;
        // Re-check: a racer may have initialized while we waited.
        if let Some(pool) = self.pools.lock().await.get(server_key).cloned() {
            return Ok(pool);
        }
        self.init_pool_locked(server_key).await
    }

    /// Borrow a connection for a server key, lazily initializing the pool.
    ///
    /// The returned connection has passed the execution-capability probe;
    /// `validate` would accept it. Fails with `ConnectionUnavailable` when
    /// no slot frees up within the acquire timeout.
    pub async fn acquire(&self, server_key: &str) -> Result<PooledConnection<T>> {
        let mut reinit_left = 1u8;
        loop {
            let pool = self.pool_or_init(server_key).await?;
            let (permit, mut conn, created_at, ops) = self.draw(&pool).await?;

            if self.transport.probe(&mut conn).await {
                pool.borrowed.fetch_add(1, Ordering::SeqCst);
                return Ok(PooledConnection {
                    conn: Some(conn),
                    transport: self.transport.clone(),
                    pool,
                    _permit: Some(permit),
                    tag: ConnectionTag {
                        origin_key: server_key.to_string(),
                        acquired_at: Instant::now(),
                        op_count: 0,
                    },
                    created_at,
                    lifetime_ops: ops,
                });
            }

            // The drawn connection cannot execute. Destroy it, rebuild the
            // pool from scratch, and retry once.
            warn!(key = server_key, "drawn connection failed verification");
            self.transport.close(conn).await;
            drop(permit);
            self.record_error(server_key, ErrorClass::Generic).await;

            if reinit_left == 0 {
                return Err(TransferError::unavailable(
                    server_key,
                    "connection failed verification after pool reinit",
                ));
            }
            reinit_left -= 1;
            self.init_pool(server_key).await?;
        }
    }

    /// Draw an idle or fresh connection from a pool, bounded by the
    /// semaphore and the acquire timeout.
    async fn draw(
        &self,
        pool: &Arc<ServerPool<T>>,
    ) -> Result<(OwnedSemaphorePermit, T::Conn, Instant, u32)> {
        let permit = match timeout(
            self.settings.acquire_timeout,
            pool.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransferError::unavailable(&pool.key, "pool is closed"));
            }
            Err(_) => {
                return Err(TransferError::unavailable(
                    &pool.key,
                    format!(
                        "no connection available within {:?}",
                        self.settings.acquire_timeout
                    ),
                ));
            }
        };

        loop {
            let candidate = {
                let mut inner = pool.inner.lock().await;
                if inner.phase == PoolPhase::Closed {
                    return Err(TransferError::unavailable(&pool.key, "pool is closed"));
                }
                inner.idle.pop_front()
            };

            match candidate {
                Some(idle) => {
                    if self.idle_is_valid(&idle) {
                        return Ok((permit, idle.conn, idle.created_at, idle.ops));
                    }
                    debug!(key = %pool.key, "evicting invalid idle connection");
                    self.transport.close(idle.conn).await;
                }
                None => {
                    let conn = match self.transport.connect(&pool.config).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.record_error(&pool.key, ErrorClass::Generic).await;
                            return Err(e);
                        }
                    };
                    return Ok((permit, conn, Instant::now(), 0));
                }
            }
        }
    }

    fn idle_is_valid(&self, idle: &IdleConn<T::Conn>) -> bool {
        self.transport.is_connected(&idle.conn)
            && idle.created_at.elapsed() <= self.settings.max_connection_age
            && idle.ops <= self.settings.max_operation_count
            && idle.idle_since.elapsed() <= self.settings.idle_timeout
    }

    /// Whether a borrowed connection would still be handed out.
    ///
    /// False (destroy on return) when the transport reports it
    /// disconnected, it is older than the age limit, or it served more
    /// operations than the limit.
    pub fn validate(&self, conn: &PooledConnection<T>) -> bool {
        let live = conn
            .conn
            .as_ref()
            .map(|c| self.transport.is_connected(c))
            .unwrap_or(false);
        live && conn.age() <= self.settings.max_connection_age
            && conn.lifetime_ops <= self.settings.max_operation_count
    }

    /// Return a connection to its origin pool.
    ///
    /// The origin is inferred from the borrow tag; if that pool has been
    /// closed in the meantime the connection is closed directly. Returns a
    /// Result the orchestration layer is free to ignore; a misbehaving
    /// release must not crash the caller's workflow.
    pub async fn release(&self, mut pooled: PooledConnection<T>) -> Result<()> {
        let Some(conn) = pooled.conn.take() else {
            return Ok(());
        };
        let pool = pooled.pool.clone();
        let created_at = pooled.created_at;
        let ops = pooled.lifetime_ops;
        let valid = self.validate_raw(&conn, created_at, ops);
        drop(pooled); // releases the permit and the borrow count

        let phase = {
            let inner = pool.inner.lock().await;
            inner.phase
        };

        if phase == PoolPhase::Closed {
            debug!(key = %pool.key, "origin pool gone; closing connection directly");
            self.transport.close(conn).await;
            return Ok(());
        }

        if !valid {
            debug!(key = %pool.key, "destroying connection on release (failed validation)");
            self.transport.close(conn).await;
            return Ok(());
        }

        let mut inner = pool.inner.lock().await;
        inner.idle.push_back(IdleConn {
            conn,
            created_at,
            ops,
            idle_since: Instant::now(),
        });
        Ok(())
    }

    fn validate_raw(&self, conn: &T::Conn, created_at: Instant, ops: u32) -> bool {
        self.transport.is_connected(conn)
            && created_at.elapsed() <= self.settings.max_connection_age
            && ops <= self.settings.max_operation_count
    }

    /// Discard any existing pool for the key, then retry
    /// {init → acquire → trivial-query verify} with exponential backoff
    /// capped at 30 s. Never panics; attempts-exhausted surfaces as a
    /// terminal `ConnectionUnavailable`; the caller must treat the server
    /// as unavailable for this run.
    pub async fn robust_connect(
        &self,
        server_key: &str,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<PooledConnection<T>> {
        const MAX_DELAY: Duration = Duration::from_secs(30);

        self.close_pool(server_key).await;

        let mut last_error: Option<TransferError> = None;
        for attempt in 1..=max_attempts {
            let outcome = async {
                self.init_pool(server_key).await?;
                let mut conn = self.acquire(server_key).await?;
                conn.query("SELECT 1", &[]).await?;
                Ok::<_, TransferError>(conn)
            }
            .await;

            match outcome {
                Ok(conn) => {
                    info!(key = server_key, attempt, "robust connect succeeded");
                    return Ok(conn);
                }
                Err(e) if matches!(e, TransferError::ConfigNotFound(_)) => {
                    // Retrying cannot conjure missing credentials.
                    return Err(e);
                }
                Err(e) => {
                    warn!(key = server_key, attempt, error = %e, "robust connect attempt failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        let delay = base_delay
                            .checked_mul(1 << (attempt - 1).min(16))
                            .unwrap_or(MAX_DELAY)
                            .min(MAX_DELAY);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(TransferError::unavailable(
            server_key,
            format!(
                "robust connect exhausted {max_attempts} attempts: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        ))
    }

    /// Record a failure against a server key's health counters. Reaching a
    /// threshold triggers proactive pool renewal and resets the counters.
    pub async fn record_error(&self, server_key: &str, class: ErrorClass) {
        if self.bump_error(server_key, class).await {
            info!(key = server_key, "error threshold reached; renewing pool");
            self.renew_pool(server_key).await;
        }
    }

    /// Bump a counter; returns whether a threshold was crossed (and resets
    /// the counters when it was). Must not renew: init paths call this
    /// while holding the init lock.
    async fn bump_error(&self, server_key: &str, class: ErrorClass) -> bool {
        let mut health = self.health.lock().await;
        let counters = health.entry(server_key.to_string()).or_default();
        match class {
            ErrorClass::Generic => counters.generic += 1,
            ErrorClass::Store => counters.store += 1,
        }
        let over = counters.generic >= self.settings.generic_error_threshold
            || counters.store >= self.settings.store_error_threshold;
        if over {
            *counters = HealthCounters::default();
        }
        over
    }

    /// Replace a pool with a fresh instance; the outgoing pool keeps
    /// serving its borrowers until drained or the grace period passes.
    pub async fn renew_pool(&self, server_key: &str) {
        let existed = self.pools.lock().await.contains_key(server_key);
        if !existed {
            return;
        }
        let _guard = self.init_lock.lock().await;
        if let Err(e) = self.init_pool_locked(server_key).await {
            // Keep the old pool; renewal is best-effort.
            warn!(key = server_key, error = %e, "pool renewal failed; keeping current pool");
        }
    }

    /// Close and remove the pool for a key. Idempotent.
    pub async fn close_pool(&self, server_key: &str) {
        let pool = self.pools.lock().await.remove(server_key);
        if let Some(pool) = pool {
            self.close_pool_conns(&pool).await;
            info!(key = server_key, "pool closed");
        }
    }

    /// Close and remove every pool. Idempotent.
    pub async fn close_all_pools(&self) {
        let keys: Vec<String> = self.pools.lock().await.keys().cloned().collect();
        for key in keys {
            self.close_pool(&key).await;
        }
    }

    async fn retire(&self, pool: Arc<ServerPool<T>>) {
        {
            let mut inner = pool.inner.lock().await;
            inner.phase = PoolPhase::Renewing;
        }
        if pool.borrowed.load(Ordering::SeqCst) == 0 {
            self.close_pool_conns(&pool).await;
            return;
        }
        debug!(key = %pool.key, "pool retired; draining under grace period");
        self.retired.lock().await.push(RetiredPool {
            pool,
            drain_deadline: Instant::now() + self.settings.renew_grace,
        });
    }

    async fn close_pool_conns(&self, pool: &Arc<ServerPool<T>>) {
        pool.semaphore.close();
        let idle = {
            let mut inner = pool.inner.lock().await;
            inner.phase = PoolPhase::Closed;
            std::mem::take(&mut inner.idle)
        };
        for entry in idle {
            self.transport.close(entry.conn).await;
        }
    }

    async fn run_maintenance(&self) {
        // Sweep idle connections past the idle timeout or otherwise invalid.
        let pools: Vec<Arc<ServerPool<T>>> = self.pools.lock().await.values().cloned().collect();
        for pool in &pools {
            let expired = {
                let mut inner = pool.inner.lock().await;
                let mut kept = VecDeque::with_capacity(inner.idle.len());
                let mut expired = Vec::new();
                while let Some(idle) = inner.idle.pop_front() {
                    if self.idle_is_valid(&idle) {
                        kept.push_back(idle);
                    } else {
                        expired.push(idle);
                    }
                }
                inner.idle = kept;
                expired
            };
            for entry in expired {
                debug!(key = %pool.key, "evicting idle connection");
                self.transport.close(entry.conn).await;
            }
        }

        // Force-renew pools past the wall-clock interval.
        for pool in &pools {
            if pool.created_at.elapsed() >= self.settings.renew_interval
                && pool.phase_blocking() == PoolPhase::Ready
            {
                info!(key = %pool.key, "wall-clock renewal");
                self.renew_pool(&pool.key).await;
            }
        }

        // Drain retired pools once empty or past their grace deadline.
        let due: Vec<RetiredPool<T>> = {
            let mut retired = self.retired.lock().await;
            let now = Instant::now();
            let (due, keep): (Vec<_>, Vec<_>) = retired.drain(..).partition(|entry| {
                entry.pool.borrowed.load(Ordering::SeqCst) == 0 || entry.drain_deadline <= now
            });
            *retired = keep;
            due
        };
        for entry in due {
            debug!(key = %entry.pool.key, "closing drained retired pool");
            self.close_pool_conns(&entry.pool).await;
        }
    }
}
