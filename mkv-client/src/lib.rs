//! # MuxKV Client
//!
//! Purpose: Async client for RESP3 key-value servers that multiplexes many
//! callers over few sockets, caches reads on the client with server-driven
//! invalidation, and routes commands across a cluster.
//!
//! ## Design Principles
//! 1. **Pipelining by Default**: Concurrent calls share a connection; order
//!    on the wire is the only request/reply correlation.
//! 2. **Explicit Ownership**: A connection is shared or dedicated, never both.
//! 3. **Coherent Caching**: Cached reads are fetched under tracking and
//!    dropped as soon as the server says they changed.
//! 4. **Immutable Topology**: Slot maps are replaced wholesale.
//!
//! ## Layering
//!
//! ```text
//! SingleClient ── Pool ── Connection ── Cache
//! ClusterClient ── ClusterRouter ── Pool (per node) ── Connection
//! ```

mod cache;
mod client;
mod cluster;
mod config;
mod connection;
mod notify;
mod pool;
mod stats;
mod topology;
mod transport;

pub use cache::{Cache, Lookup};
pub use client::{ClusterClient, ClusterDedicated, DedicatedClient, SingleClient};
pub use cluster::ClusterRouter;
pub use config::{
    ClientConfig, ClusterConfig, ConnConfig, TlsConfig, DEFAULT_CACHE_SIZE, DEFAULT_DEDICATED_POOL_SIZE,
    DEFAULT_MAX_REDIRECTS,
};
pub use connection::{ConnState, Connection};
pub use notify::{MessageHandler, MessageKind, PubSubHandlers, PubSubMessage, Subscription, SubscriptionHandler, SubscriptionKind};
pub use pool::{DedicatedConnection, Pool};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use topology::{Redirect, RedirectKind, Topology};
pub use transport::split_addr;

pub use mkv_common::{
    hash_slot, is_nil, Command, CommandBuilder, Error, ProtocolError, RespValue, Result, SlotMode, SLOT_COUNT,
};
