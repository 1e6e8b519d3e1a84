//! # Client Facades
//!
//! Purpose: Bundle a command builder with a [`Pool`] (single node) or a
//! [`ClusterRouter`] (cluster) behind one small async API.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Callers never pick connections themselves.
//! 2. **Commands by Value**: Each call consumes its command so the encode
//!    buffer goes back to the builder's pool as soon as the reply arrives.
//! 3. **Deadlines Bound the Wait Only**: A timed-out request may still run
//!    on the server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mkv_common::{Command, CommandBuilder, Error, RespValue, Result, SlotMode};

use crate::cluster::{batch_slot, ClusterRouter};
use crate::config::{ClientConfig, ClusterConfig};
use crate::pool::{DedicatedConnection, Pool};
use crate::stats::StatsSnapshot;
use crate::topology::Topology;

async fn with_deadline<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

/// Client for one server.
#[derive(Debug, Clone)]
pub struct SingleClient {
    pool: Pool,
    builder: CommandBuilder,
}

impl SingleClient {
    /// Connects to `addr` with default settings.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config).await
    }

    /// Connects with a custom configuration. The first connection is dialed
    /// before this returns.
    pub async fn with_config(config: ClientConfig) -> Result<Self> {
        let pool = Pool::dial(&config.addr, config.conn).await?;
        Ok(SingleClient {
            pool,
            builder: CommandBuilder::new(SlotMode::NoSlot),
        })
    }

    /// Builder whose commands recycle into this client's buffer pool.
    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub async fn execute(&self, cmd: Command) -> Result<RespValue> {
        self.pool.execute(&cmd).await
    }

    /// Cached read; `cmd` must be built with `.cacheable()` and a key.
    pub async fn execute_cached(&self, cmd: Command, ttl: Duration) -> Result<RespValue> {
        self.pool.execute_cached(&cmd, ttl).await
    }

    /// Pipelines `cmds` without interleaving other callers' traffic.
    pub async fn execute_batch(&self, cmds: Vec<Command>) -> Result<Vec<RespValue>> {
        self.pool.execute_batch(&cmds).await
    }

    /// Like [`SingleClient::execute`], failing with [`Error::Timeout`] once
    /// `timeout` elapses.
    pub async fn execute_with_deadline(&self, cmd: Command, timeout: Duration) -> Result<RespValue> {
        with_deadline(timeout, self.pool.execute(&cmd)).await
    }

    /// Checks out a connection for transactions, blocking commands or
    /// subscriptions.
    pub async fn dedicated(&self) -> Result<DedicatedClient> {
        let conn = self.pool.acquire().await?;
        Ok(DedicatedClient { conn })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

/// Exclusive connection handed out by [`SingleClient::dedicated`].
/// Dropping it returns the connection.
#[derive(Debug)]
pub struct DedicatedClient {
    conn: DedicatedConnection,
}

impl DedicatedClient {
    pub async fn execute(&self, cmd: Command) -> Result<RespValue> {
        self.conn.execute(&cmd).await
    }

    pub async fn execute_batch(&self, cmds: Vec<Command>) -> Result<Vec<RespValue>> {
        self.conn.execute_batch(&cmds).await
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Returns the connection to shared rotation.
    pub fn release(self) {
        drop(self);
    }
}

/// Client for a cluster.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    router: ClusterRouter,
    builder: CommandBuilder,
}

impl ClusterClient {
    /// Discovers the cluster from `seeds` with default settings.
    pub async fn connect<I, S>(seeds: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = ClusterConfig {
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..ClusterConfig::default()
        };
        Self::with_config(config).await
    }

    pub async fn with_config(config: ClusterConfig) -> Result<Self> {
        let router = ClusterRouter::connect(config).await?;
        Ok(ClusterClient {
            router,
            builder: CommandBuilder::new(SlotMode::Compute),
        })
    }

    /// Builder that computes slots for every key argument.
    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub async fn execute(&self, cmd: Command) -> Result<RespValue> {
        self.router.execute(&cmd).await
    }

    pub async fn execute_cached(&self, cmd: Command, ttl: Duration) -> Result<RespValue> {
        self.router.execute_cached(&cmd, ttl).await
    }

    /// Every command must hash to the same slot.
    pub async fn execute_batch(&self, cmds: Vec<Command>) -> Result<Vec<RespValue>> {
        self.router.execute_batch(&cmds).await
    }

    pub async fn execute_with_deadline(&self, cmd: Command, timeout: Duration) -> Result<RespValue> {
        with_deadline(timeout, self.router.execute(&cmd)).await
    }

    /// Dedicated connection bound lazily to the node of the first command.
    pub fn dedicated(&self) -> ClusterDedicated {
        ClusterDedicated {
            router: self.router.clone(),
            conn: None,
        }
    }

    pub fn router(&self) -> &ClusterRouter {
        &self.router
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.router.topology()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.router.stats()
    }

    pub fn close(&self) {
        self.router.close();
    }
}

/// Dedicated connection of a cluster client. Commands after the first must
/// be served by the same node.
#[derive(Debug)]
pub struct ClusterDedicated {
    router: ClusterRouter,
    conn: Option<DedicatedConnection>,
}

impl ClusterDedicated {
    pub async fn execute(&mut self, cmd: Command) -> Result<RespValue> {
        if cmd.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        let conn = self.bind(cmd.slot()).await?;
        conn.execute(&cmd).await
    }

    pub async fn execute_batch(&mut self, cmds: Vec<Command>) -> Result<Vec<RespValue>> {
        let slot = batch_slot(&cmds)?;
        let conn = self.bind(slot).await?;
        conn.execute_batch(&cmds).await
    }

    /// Address of the bound node, once a command ran.
    pub fn addr(&self) -> Option<&str> {
        self.conn.as_ref().map(|conn| conn.addr())
    }

    async fn bind(&mut self, slot: Option<u16>) -> Result<&DedicatedConnection> {
        if let Some(conn) = &self.conn {
            if let Some(slot) = slot {
                let topology = self.router.topology();
                if topology.node_for_slot(slot) != Some(conn.addr()) {
                    return Err(Error::CrossSlot);
                }
            }
        } else {
            self.conn = Some(self.router.acquire(slot).await?);
        }
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }
}
