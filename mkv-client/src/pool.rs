//! # Connection Pool
//!
//! Purpose: Present one logical multiplexed connection per destination while
//! bounding the number of real sockets.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A fixed set of shared slots carries ordinary
//!    traffic; dedicated connections are checked out and handed back.
//! 2. **Lazy Replacement**: Closed connections are re-dialed on their next
//!    selection, one dial per slot at a time.
//! 3. **Bounded Checkout**: A semaphore caps dedicated connections; waiters
//!    park instead of failing.
//! 4. **RAII Release**: `DedicatedConnection` returns itself on drop.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mkv_common::{Command, Error, RespValue, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ConnConfig;
use crate::connection::Connection;
use crate::stats::StatsSnapshot;

/// Shared connection position; dialed lazily.
struct SharedSlot {
    conn: RwLock<Option<Arc<Connection>>>,
    dialing: tokio::sync::Mutex<()>,
}

struct PoolInner {
    addr: String,
    config: ConnConfig,
    slots: Vec<SharedSlot>,
    /// Released dedicated connections; they serve shared traffic until the
    /// next checkout.
    spares: Mutex<VecDeque<Arc<Connection>>>,
    /// Dedicated connections currently checked out, by connection id.
    leased: Mutex<HashMap<u64, Arc<Connection>>>,
    next: AtomicUsize,
    dedicated: Arc<Semaphore>,
    closed: AtomicBool,
}

/// Connections to one destination.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates the pool and dials its first shared connection. A failure
    /// here is returned as is.
    pub async fn dial(addr: &str, config: ConnConfig) -> Result<Pool> {
        let shared = config.shared_connections.max(1);
        let inner = PoolInner {
            addr: addr.to_string(),
            slots: (0..shared)
                .map(|_| SharedSlot {
                    conn: RwLock::new(None),
                    dialing: tokio::sync::Mutex::new(()),
                })
                .collect(),
            spares: Mutex::new(VecDeque::new()),
            leased: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(0),
            dedicated: Arc::new(Semaphore::new(config.dedicated_pool_size.max(1))),
            closed: AtomicBool::new(false),
            config,
        };
        let pool = Pool { inner: Arc::new(inner) };
        pool.shared_slot(0).await?;
        debug!(addr, shared, "pool ready");
        Ok(pool)
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Live connections currently serving shared traffic.
    pub fn in_rotation(&self) -> usize {
        let shared = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.conn.read().as_ref().map_or(false, |conn| !conn.is_closed()))
            .count();
        let spares = self.inner.spares.lock().iter().filter(|conn| !conn.is_closed()).count();
        shared + spares
    }

    /// Dedicated connections currently checked out.
    pub fn leased(&self) -> usize {
        self.inner.leased.lock().len()
    }

    pub async fn execute(&self, cmd: &Command) -> Result<RespValue> {
        loop {
            let conn = self.pick().await?;
            if let Some(result) = conn.execute_shared(cmd).await {
                return result;
            }
        }
    }

    pub async fn execute_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue> {
        loop {
            let conn = self.pick().await?;
            if let Some(result) = conn.execute_cached_shared(cmd, ttl).await {
                return result;
            }
        }
    }

    pub async fn execute_batch(&self, cmds: &[Command]) -> Result<Vec<RespValue>> {
        loop {
            let conn = self.pick().await?;
            if let Some(result) = conn.execute_batch_shared(cmds).await {
                return result;
            }
        }
    }

    /// Checks out a connection for exclusive use, waiting while the
    /// dedicated ceiling is reached.
    pub async fn acquire(&self) -> Result<DedicatedConnection> {
        self.ensure_open()?;
        let permit = Arc::clone(&self.inner.dedicated)
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        self.ensure_open()?;

        let conn = match self.take_spare() {
            Some(conn) => conn,
            None => {
                let conn = Arc::new(Connection::connect(&self.inner.addr, &self.inner.config).await?);
                conn.try_dedicate();
                conn
            }
        };
        if self.is_closed() {
            conn.close();
            return Err(Error::ConnectionClosed);
        }

        self.inner.leased.lock().insert(conn.id(), Arc::clone(&conn));
        debug!(addr = %self.inner.addr, conn = conn.id(), "dedicated connection acquired");
        Ok(DedicatedConnection {
            conn,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Returns a dedicated connection to rotation; same as dropping it.
    pub fn release(&self, conn: DedicatedConnection) {
        drop(conn);
    }

    /// Closes every connection. Later calls, and parked `acquire`s, fail
    /// with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dedicated.close();
        for slot in &self.inner.slots {
            if let Some(conn) = slot.conn.write().take() {
                conn.close();
            }
        }
        for conn in self.inner.spares.lock().drain(..) {
            conn.close();
        }
        for (_, conn) in self.inner.leased.lock().drain() {
            conn.close();
        }
        debug!(addr = %self.inner.addr, "pool closed");
    }

    /// Sum of the counters of every connection the pool holds.
    pub fn stats(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for slot in &self.inner.slots {
            if let Some(conn) = slot.conn.read().as_ref() {
                total = total + conn.stats();
            }
        }
        for conn in self.inner.spares.lock().iter() {
            total = total + conn.stats();
        }
        for conn in self.inner.leased.lock().values() {
            total = total + conn.stats();
        }
        total
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Round-robin over shared slots followed by spares.
    async fn pick(&self) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        let shared = self.inner.slots.len();
        let spare_count = self.inner.spares.lock().len();
        let n = self.inner.next.fetch_add(1, Ordering::Relaxed) % (shared + spare_count);

        if n >= shared {
            let spare = {
                let mut spares = self.inner.spares.lock();
                spares.retain(|conn| !conn.is_closed());
                spares.get(n - shared).cloned()
            };
            if let Some(conn) = spare {
                return Ok(conn);
            }
        }
        self.shared_slot(n % shared).await
    }

    async fn shared_slot(&self, idx: usize) -> Result<Arc<Connection>> {
        let slot = &self.inner.slots[idx];
        let current = slot.conn.read().clone();
        if let Some(conn) = current.filter(|conn| !conn.is_closed()) {
            return Ok(conn);
        }

        let _dialing = slot.dialing.lock().await;
        let current = slot.conn.read().clone();
        if let Some(conn) = current.filter(|conn| !conn.is_closed()) {
            return Ok(conn);
        }
        self.ensure_open()?;

        let conn = Arc::new(Connection::connect(&self.inner.addr, &self.inner.config).await?);
        if self.is_closed() {
            conn.close();
            return Err(Error::ConnectionClosed);
        }
        *slot.conn.write() = Some(Arc::clone(&conn));
        debug!(addr = %self.inner.addr, slot = idx, conn = conn.id(), "shared connection dialed");
        Ok(conn)
    }

    fn take_spare(&self) -> Option<Arc<Connection>> {
        let mut spares = self.inner.spares.lock();
        while let Some(conn) = spares.pop_front() {
            if conn.try_dedicate() {
                return Some(conn);
            }
        }
        None
    }
}

impl PoolInner {
    fn release(&self, conn: Arc<Connection>) {
        self.leased.lock().remove(&conn.id());
        if conn.is_closed() || self.closed.load(Ordering::Acquire) {
            conn.close();
            debug!(addr = %self.addr, conn = conn.id(), "discarded dedicated connection");
            return;
        }
        conn.undedicate();
        self.spares.lock().push_back(conn);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive handle on one connection. Dropping it hands the connection
/// back to its pool.
///
/// Ownership only changes through [`Pool::acquire`] and release; the
/// handle cannot put its connection back into rotation itself:
///
/// ```compile_fail
/// async fn lease(pool: &mkv_client::Pool) -> mkv_client::Result<()> {
///     let conn = pool.acquire().await?;
///     conn.undedicate();
///     Ok(())
/// }
/// ```
pub struct DedicatedConnection {
    conn: Arc<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for DedicatedConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for DedicatedConnection {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.conn));
    }
}

impl std::fmt::Debug for DedicatedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
