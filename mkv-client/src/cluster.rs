//! # Cluster Routing
//!
//! Purpose: Send every command to the node that owns its hash slot, and keep
//! the slot map current from redirect replies and `CLUSTER SLOTS`.
//!
//! ## Design Principles
//! 1. **One Pool per Node**: Pools are created on first use and closed when
//!    a refresh drops their node.
//! 2. **Copy-on-Write Topology**: Readers clone an `Arc<Topology>`; writers
//!    publish a new map instead of editing the current one.
//! 3. **Bounded Redirects**: `MOVED`/`ASK` are followed at most
//!    `max_redirects` times, then the redirect reply is returned verbatim.
//! 4. **Single-Flight Refresh**: Background refreshes never overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mkv_common::{Command, Error, RespValue, Result};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::pool::{DedicatedConnection, Pool};
use crate::stats::StatsSnapshot;
use crate::topology::{Redirect, RedirectKind, Topology};

struct RouterInner {
    config: ClusterConfig,
    pools: RwLock<HashMap<String, Pool>>,
    topology: RwLock<Arc<Topology>>,
    /// Serializes full refreshes.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Set while a background refresh is scheduled or running.
    refreshing: AtomicBool,
    closed: AtomicBool,
    next_node: AtomicUsize,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    asking: Command,
}

/// Slot-aware front end over one [`Pool`] per cluster node.
#[derive(Clone)]
pub struct ClusterRouter {
    inner: Arc<RouterInner>,
}

impl ClusterRouter {
    /// Discovers the topology from the seeds. Fails when no seed answers.
    pub async fn connect(config: ClusterConfig) -> Result<ClusterRouter> {
        if config.seeds.is_empty() {
            return Err(Error::Topology("no seed nodes configured".to_string()));
        }
        let refresh_interval = config.refresh_interval;
        let router = ClusterRouter {
            inner: Arc::new(RouterInner {
                config,
                pools: RwLock::new(HashMap::new()),
                topology: RwLock::new(Arc::new(Topology::default())),
                refresh_lock: tokio::sync::Mutex::new(()),
                refreshing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_node: AtomicUsize::new(0),
                refresh_task: Mutex::new(None),
                asking: Command::from_args(&[b"ASKING"]),
            }),
        };
        router.inner.refresh().await?;

        if let Some(period) = refresh_interval {
            let task = tokio::spawn(refresh_periodically(Arc::downgrade(&router.inner), period));
            *router.inner.refresh_task.lock() = Some(task);
        }
        Ok(router)
    }

    /// Current slot map.
    pub fn topology(&self) -> Arc<Topology> {
        self.inner.topology.read().clone()
    }

    /// Re-reads `CLUSTER SLOTS` now.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    pub async fn execute(&self, cmd: &Command) -> Result<RespValue> {
        self.inner.route(cmd, None).await
    }

    /// Cached read on the slot owner. A read redirected by `ASK` runs
    /// uncached on the importing node.
    pub async fn execute_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue> {
        self.inner.route(cmd, Some(ttl)).await
    }

    /// Runs a batch on the owner of its single slot. Redirects inside a
    /// batch are returned as replies.
    pub async fn execute_batch(&self, cmds: &[Command]) -> Result<Vec<RespValue>> {
        let slot = batch_slot(cmds)?;
        let pool = self.inner.pool_for_slot(slot).await?;
        pool.execute_batch(cmds).await
    }

    /// Checks out a dedicated connection of the node owning `slot`
    /// (any node for `None`).
    pub async fn acquire(&self, slot: Option<u16>) -> Result<DedicatedConnection> {
        let pool = self.inner.pool_for_slot(slot).await?;
        pool.acquire().await
    }

    /// Addresses with an open pool.
    pub fn pool_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.inner.pools.read().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .pools
            .read()
            .values()
            .fold(StatsSnapshot::default(), |total, pool| total + pool.stats())
    }

    /// Closes every pool and stops background refreshes.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }
        for (_, pool) in self.inner.pools.write().drain() {
            pool.close();
        }
        debug!("cluster router closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl RouterInner {
    async fn route(self: &Arc<Self>, cmd: &Command, ttl: Option<Duration>) -> Result<RespValue> {
        if cmd.is_cross_slot() {
            return Err(Error::CrossSlot);
        }

        let mut target: Option<String> = None;
        let mut asking = false;
        let mut redirects = 0;
        let mut moves = 0;
        loop {
            let pool = match &target {
                Some(addr) => self.pool(addr).await?,
                None => self.pool_for_slot(cmd.slot()).await?,
            };

            let outcome = if asking {
                pool.execute_batch(&[self.asking.clone(), cmd.clone()])
                    .await
                    .map(|mut replies| replies.pop().unwrap_or(RespValue::Null))
            } else {
                match ttl {
                    Some(ttl) => pool.execute_cached(cmd, ttl).await,
                    None => pool.execute(cmd).await,
                }
            };
            let reply = match outcome {
                Ok(reply) => reply,
                Err(err) => {
                    // The request may have run; only the map is repaired.
                    if err.is_connection_failure() {
                        self.schedule_refresh();
                    }
                    return Err(err);
                }
            };

            let Some(redirect) = Redirect::parse(&reply, pool.addr()) else {
                return Ok(reply);
            };
            if redirects >= self.config.max_redirects {
                debug!(slot = redirect.slot, addr = %redirect.addr, "redirect limit reached");
                return Ok(reply);
            }
            redirects += 1;

            debug!(kind = ?redirect.kind, slot = redirect.slot, addr = %redirect.addr, "following redirect");
            match redirect.kind {
                RedirectKind::Moved => {
                    moves += 1;
                    let known = self.install_slot(redirect.slot, &redirect.addr);
                    if !known || moves > 1 {
                        self.schedule_refresh();
                    }
                    asking = false;
                }
                RedirectKind::Ask => asking = true,
            }
            target = Some(redirect.addr);
        }
    }

    /// Publishes a copy of the map with `slot` owned by `addr`. Returns
    /// whether `addr` was already part of the map.
    fn install_slot(&self, slot: u16, addr: &str) -> bool {
        let mut topology = self.topology.write();
        let known = topology.contains(addr);
        *topology = Arc::new(topology.with_slot(slot, addr));
        known
    }

    async fn pool_for_slot(&self, slot: Option<u16>) -> Result<Pool> {
        let addr = {
            let topology = self.topology.read().clone();
            match slot {
                Some(slot) => topology
                    .node_for_slot(slot)
                    .map(str::to_string)
                    .ok_or(Error::SlotUnassigned(slot))?,
                None => {
                    let nodes = topology.nodes();
                    if nodes.is_empty() {
                        return Err(Error::Topology("no known nodes".to_string()));
                    }
                    let idx = self.next_node.fetch_add(1, Ordering::Relaxed) % nodes.len();
                    nodes[idx].clone()
                }
            }
        };
        self.pool(&addr).await
    }

    async fn pool(&self, addr: &str) -> Result<Pool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let existing = self.pools.read().get(addr).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let pool = Pool::dial(addr, self.config.conn.clone()).await?;
        let mut pools = self.pools.write();
        if self.closed.load(Ordering::Acquire) {
            pool.close();
            return Err(Error::ConnectionClosed);
        }
        match pools.get(addr) {
            Some(winner) => {
                let winner = winner.clone();
                pool.close();
                Ok(winner)
            }
            None => {
                pools.insert(addr.to_string(), pool.clone());
                Ok(pool)
            }
        }
    }

    /// Asks known nodes, then seeds, for `CLUSTER SLOTS` until one answers.
    async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let mut candidates: Vec<String> = self.topology.read().nodes().to_vec();
        for seed in &self.config.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let query = Command::from_args(&[b"CLUSTER", b"SLOTS"]);
        let mut last_error = None;
        for addr in candidates {
            let parsed = match self.pool(&addr).await {
                Ok(pool) => match pool.execute(&query).await {
                    Ok(reply) => Topology::from_cluster_slots(&reply, &addr),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match parsed {
                Ok(topology) if topology.assigned_slots() > 0 => {
                    self.install(topology);
                    return Ok(());
                }
                Ok(_) => last_error = Some(Error::Topology(format!("{} serves no slots", addr))),
                Err(err) => {
                    debug!(addr = %addr, error = %err, "topology query failed");
                    last_error = Some(err);
                }
            }
        }
        let reason = last_error.map_or_else(|| "no candidates".to_string(), |err| err.to_string());
        Err(Error::Topology(format!("no node answered CLUSTER SLOTS: {}", reason)))
    }

    /// Replaces the map and closes pools of nodes it no longer lists.
    fn install(&self, topology: Topology) {
        let removed: Vec<Pool> = {
            let mut pools = self.pools.write();
            let stale: Vec<String> = pools
                .keys()
                .filter(|addr| !topology.contains(addr))
                .cloned()
                .collect();
            stale.iter().filter_map(|addr| pools.remove(addr)).collect()
        };
        debug!(
            nodes = topology.nodes().len(),
            removed = removed.len(),
            "installed cluster topology"
        );
        *self.topology.write() = Arc::new(topology);
        for pool in removed {
            pool.close();
        }
    }

    fn schedule_refresh(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.refresh().await {
                warn!(error = %err, "background topology refresh failed");
            }
            inner.refreshing.store(false, Ordering::Release);
        });
    }
}

async fn refresh_periodically(inner: Weak<RouterInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; connect already refreshed.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = inner.refresh().await {
            warn!(error = %err, "periodic topology refresh failed");
        }
    }
}

/// The one slot every command of a batch hashes to.
pub(crate) fn batch_slot(cmds: &[Command]) -> Result<Option<u16>> {
    let mut slot = None;
    for cmd in cmds {
        if cmd.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        match (slot, cmd.slot()) {
            (Some(current), Some(next)) if current != next => return Err(Error::CrossSlot),
            (None, Some(next)) => slot = Some(next),
            _ => {}
        }
    }
    Ok(slot)
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("nodes", &self.topology().nodes())
            .field("closed", &self.is_closed())
            .finish()
    }
}
