//! # Multiplexed Connection
//!
//! Purpose: Run any number of concurrent callers over one socket, matching
//! replies to requests purely by order.
//!
//! ## Design Principles
//! 1. **Single Writer**: Callers hand encoded requests to one writer task;
//!    it registers pending slots in exactly the order it writes bytes.
//! 2. **Demultiplexing Reader**: One reader task splits the stream into
//!    ordered replies and push notifications.
//! 3. **Fail Whole**: Any I/O or framing error closes the connection and
//!    fails every pending caller; nothing is retried here.
//! 4. **Explicit Ownership**: A connection is either in shared rotation or
//!    held by one dedicated caller, and shared submissions check it.
//!
//! ## Data Flow
//!
//! ```text
//! callers --Request--> mpsc --> writer task --bytes--> socket
//!    ^                             | push slots
//!    |                             v
//!    +----oneshot---- pending FIFO <-- reader task <--frames-- socket
//!                                         |
//!                                         +--> cache invalidation
//!                                         +--> notification task
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mkv_common::{Command, Decoder, Encoded, Error, ProtocolError, RespValue, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::cache::{Cache, Lookup};
use crate::config::ConnConfig;
use crate::notify::{self, Notification, Push};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::{self, BoxStream};

/// Initial read buffer capacity.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Upper bound of bytes coalesced into one socket write.
const MAX_COALESCE: usize = 64 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Ready,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Shared,
    Dedicated,
}

/// Who is submitting: the holder of the connection, or the shared rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Owner,
    Shared,
}

/// Why a submission did not produce a reply.
enum Rejected {
    /// Shared submission to a dedicated connection; pick another.
    Dedicated,
    Failed(Error),
}

impl From<Error> for Rejected {
    fn from(err: Error) -> Self {
        Rejected::Failed(err)
    }
}

impl Rejected {
    fn into_error(self) -> Error {
        match self {
            Rejected::Failed(err) => err,
            Rejected::Dedicated => Error::ConnectionClosed,
        }
    }
}

type Attempt<T> = std::result::Result<T, Rejected>;

/// Completes one caller once its reply (or confirmations) arrive.
struct PendingSlot {
    /// Push confirmations still expected; 0 for ordinary replies.
    acks: usize,
    confirmations: Vec<RespValue>,
    tx: oneshot::Sender<Result<RespValue>>,
}

impl PendingSlot {
    fn finish(self, reply: Result<RespValue>) {
        // A dropped receiver means the caller gave up; the reply is discarded.
        let _ = self.tx.send(reply);
    }
}

/// Unit of writer admission. All parts are written back to back.
struct Request {
    parts: Vec<Encoded>,
    slots: Vec<PendingSlot>,
}

struct Queue {
    slots: VecDeque<PendingSlot>,
    closed: bool,
}

/// Commands the cached-read pipeline wraps around the user's read.
struct TrackingCommands {
    caching_yes: Encoded,
    multi: Encoded,
    exec: Encoded,
}

impl TrackingCommands {
    fn new() -> Self {
        TrackingCommands {
            caching_yes: Command::from_args(&[b"CLIENT", b"CACHING", b"YES"]).encoded(),
            multi: Command::from_args(&[b"MULTI"]).encoded(),
            exec: Command::from_args(&[b"EXEC"]).encoded(),
        }
    }
}

struct Shared {
    addr: String,
    id: u64,
    requests: mpsc::UnboundedSender<Request>,
    queue: Mutex<Queue>,
    cache: Option<Mutex<Cache>>,
    state: AtomicU8,
    ownership: Mutex<Ownership>,
    shutdown: watch::Sender<bool>,
    notify: Option<mpsc::UnboundedSender<Notification>>,
    tracking: TrackingCommands,
    stats: ConnectionStats,
}

/// One socket shared by concurrent callers.
///
/// Dropping the handle shuts the connection down.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Dials `addr`, starts the I/O tasks and runs the handshake.
    pub async fn connect(addr: &str, config: &ConnConfig) -> Result<Connection> {
        let stream = transport::dial(addr, config).await?;
        let (reader, writer) = tokio::io::split(stream);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let notify = (!config.pubsub.is_empty()).then(|| notify::spawn_dispatcher(config.pubsub.clone()));
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new(Shared {
            addr: addr.to_string(),
            id,
            requests,
            queue: Mutex::new(Queue {
                slots: VecDeque::new(),
                closed: false,
            }),
            cache: (config.cache_size > 0).then(|| Mutex::new(Cache::new(config.cache_size))),
            state: AtomicU8::new(ConnState::Connecting as u8),
            ownership: Mutex::new(Ownership::Shared),
            shutdown,
            notify,
            tracking: TrackingCommands::new(),
            stats: ConnectionStats::new(),
        });

        tokio::spawn(write_loop(
            Arc::clone(&shared),
            writer,
            request_rx,
            shared.shutdown.subscribe(),
        ));
        tokio::spawn(read_loop(Arc::clone(&shared), reader, shared.shutdown.subscribe()));

        let conn = Connection { shared };
        if let Err(err) = conn.handshake(config).await {
            conn.close();
            return Err(err);
        }
        conn.shared.state.store(ConnState::Ready as u8, Ordering::Release);
        debug!(addr, conn = id, "connection ready");
        Ok(conn)
    }

    async fn handshake(&self, config: &ConnConfig) -> Result<()> {
        let mut hello: Vec<&[u8]> = vec![&b"HELLO"[..], &b"3"[..]];
        if let Some(password) = &config.password {
            hello.push(b"AUTH");
            hello.push(config.username.as_deref().unwrap_or("default").as_bytes());
            hello.push(password.as_bytes());
        }
        if let Some(name) = &config.client_name {
            hello.push(b"SETNAME");
            hello.push(name.as_bytes());
        }

        let mut cmds = vec![Command::from_args(&hello)];
        let db = config.select_db.to_string();
        if config.select_db != 0 {
            cmds.push(Command::from_args(&[b"SELECT", db.as_bytes()]));
        }
        if self.shared.cache.is_some() {
            cmds.push(Command::from_args(&[b"CLIENT", b"TRACKING", b"ON", b"OPTIN"]));
        }

        for reply in self.execute_batch(&cmds).await? {
            if let Some(message) = reply.error_message() {
                return Err(Error::Handshake(String::from_utf8_lossy(message).into_owned()));
            }
        }
        Ok(())
    }

    /// Address this connection was dialed with.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Process-unique connection id, used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Number of requests written (or queued to be written) but not answered.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().slots.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Cached entries currently held; 0 when caching is disabled.
    pub fn cached_entries(&self) -> usize {
        self.shared.cache.as_ref().map_or(0, |cache| cache.lock().len())
    }

    /// Sends one command and waits for its reply.
    pub async fn execute(&self, cmd: &Command) -> Result<RespValue> {
        self.run_one(cmd, Access::Owner).await.map_err(Rejected::into_error)
    }

    /// Serves a cacheable read from the local cache, fetching it under
    /// server-side tracking on a miss.
    pub async fn execute_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue> {
        self.run_cached(cmd, ttl, Access::Owner)
            .await
            .map_err(Rejected::into_error)
    }

    /// Writes every command contiguously, then collects replies in order.
    pub async fn execute_batch(&self, cmds: &[Command]) -> Result<Vec<RespValue>> {
        self.run_batch(cmds, Access::Owner)
            .await
            .map_err(Rejected::into_error)
    }

    /// Shared-rotation variant of [`Connection::execute`]. `None` means the
    /// connection was dedicated in the meantime.
    pub(crate) async fn execute_shared(&self, cmd: &Command) -> Option<Result<RespValue>> {
        settle(self.run_one(cmd, Access::Shared).await)
    }

    pub(crate) async fn execute_cached_shared(&self, cmd: &Command, ttl: Duration) -> Option<Result<RespValue>> {
        settle(self.run_cached(cmd, ttl, Access::Shared).await)
    }

    pub(crate) async fn execute_batch_shared(&self, cmds: &[Command]) -> Option<Result<Vec<RespValue>>> {
        settle(self.run_batch(cmds, Access::Shared).await)
    }

    /// Takes the connection out of shared rotation. Fails when it is closed
    /// or already dedicated.
    pub(crate) fn try_dedicate(&self) -> bool {
        let mut ownership = self.shared.ownership.lock();
        if *ownership == Ownership::Dedicated || self.is_closed() {
            return false;
        }
        *ownership = Ownership::Dedicated;
        true
    }

    /// Puts the connection back into shared rotation.
    pub(crate) fn undedicate(&self) {
        *self.shared.ownership.lock() = Ownership::Shared;
    }

    pub fn is_dedicated(&self) -> bool {
        *self.shared.ownership.lock() == Ownership::Dedicated
    }

    /// Shuts the connection down. Pending and future calls fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.shared.shutdown_with(None);
    }

    async fn run_one(&self, cmd: &Command, access: Access) -> Attempt<RespValue> {
        let mut receivers = self.submit(vec![cmd.encoded()], vec![cmd.push_acks()], access)?;
        match receivers.pop() {
            Some(rx) => Ok(wait(rx).await?),
            None => Err(Error::ConnectionClosed.into()),
        }
    }

    async fn run_batch(&self, cmds: &[Command], access: Access) -> Attempt<Vec<RespValue>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        let parts = cmds.iter().map(Command::encoded).collect();
        let acks = cmds.iter().map(Command::push_acks).collect();
        let receivers = self.submit(parts, acks, access)?;

        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            replies.push(wait(rx).await?);
        }
        Ok(replies)
    }

    async fn run_cached(&self, cmd: &Command, ttl: Duration, access: Access) -> Attempt<RespValue> {
        if !cmd.is_cacheable() {
            return Err(Error::NotCacheable.into());
        }
        let key = cmd.key().ok_or(Error::NotCacheable)?;
        let Some(cache) = &self.shared.cache else {
            return self.run_one(cmd, access).await;
        };
        if access == Access::Shared && self.is_dedicated() {
            return Err(Rejected::Dedicated);
        }

        let fingerprint = cmd.as_bytes();
        loop {
            if self.is_closed() {
                return Err(Error::ConnectionClosed.into());
            }
            let lookup = cache.lock().lookup(fingerprint, cmd.keys(), Instant::now());
            match lookup {
                Lookup::Hit(value) => {
                    self.shared.stats.record_cache_hit();
                    return Ok(value);
                }
                Lookup::Pending(rx) => {
                    if let Ok(value) = rx.await {
                        self.shared.stats.record_cache_hit();
                        return Ok(value);
                    }
                    // The fetch we waited on was abandoned or invalidated.
                }
                Lookup::Miss(token) => {
                    self.shared.stats.record_cache_miss();
                    let guard = FetchGuard {
                        cache,
                        fingerprint,
                        token,
                        armed: true,
                    };
                    return self.fetch_tracked(cmd, key, ttl, access, guard).await;
                }
            }
        }
    }

    async fn fetch_tracked(
        &self,
        cmd: &Command,
        key: &[u8],
        ttl: Duration,
        access: Access,
        mut guard: FetchGuard<'_>,
    ) -> Attempt<RespValue> {
        let tracking = &self.shared.tracking;
        let pttl = Command::from_args(&[b"PTTL", key]);
        let parts = vec![
            tracking.caching_yes.clone(),
            tracking.multi.clone(),
            pttl.encoded(),
            cmd.encoded(),
            tracking.exec.clone(),
        ];
        let receivers = self.submit(parts, vec![0; 5], access)?;
        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            replies.push(wait(rx).await?);
        }

        // CACHING, MULTI, QUEUED, QUEUED, EXEC
        let exec = replies.pop().unwrap_or(RespValue::Null);
        let queued = replies.pop().unwrap_or(RespValue::Null);
        let mut results = match exec {
            RespValue::Array(results) if results.len() == 2 => results,
            other => {
                return Ok(if queued.is_error() { queued } else { other });
            }
        };
        let value = results.pop().unwrap_or(RespValue::Null);
        if value.is_error() {
            return Ok(value);
        }

        let server_ttl = results
            .pop()
            .and_then(|reply| reply.as_i64().ok())
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        let lifetime = server_ttl.map_or(ttl, |server| server.min(ttl));
        guard.store(value.clone(), Instant::now() + lifetime);
        Ok(value)
    }

    /// Hands parts to the writer. Returns one receiver per part.
    fn submit(
        &self,
        parts: Vec<Encoded>,
        acks: Vec<usize>,
        access: Access,
    ) -> Attempt<Vec<oneshot::Receiver<Result<RespValue>>>> {
        // Held across the send so a concurrent dedicate cannot slip between
        // the check and the write admission.
        let _ownership = match access {
            Access::Shared => {
                let ownership = self.shared.ownership.lock();
                if *ownership == Ownership::Dedicated {
                    return Err(Rejected::Dedicated);
                }
                Some(ownership)
            }
            Access::Owner => None,
        };
        if self.is_closed() {
            return Err(Error::ConnectionClosed.into());
        }

        let mut slots = Vec::with_capacity(parts.len());
        let mut receivers = Vec::with_capacity(parts.len());
        for acks in acks {
            let (tx, rx) = oneshot::channel();
            slots.push(PendingSlot {
                acks,
                confirmations: Vec::new(),
                tx,
            });
            receivers.push(rx);
        }

        self.shared
            .requests
            .send(Request { parts, slots })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(receivers)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown_with(None);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.addr)
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

fn settle<T>(attempt: Attempt<T>) -> Option<Result<T>> {
    match attempt {
        Ok(value) => Some(Ok(value)),
        Err(Rejected::Dedicated) => None,
        Err(Rejected::Failed(err)) => Some(Err(err)),
    }
}

async fn wait(rx: oneshot::Receiver<Result<RespValue>>) -> Result<RespValue> {
    rx.await.unwrap_or(Err(Error::ConnectionClosed))
}

/// Releases a pending cache marker unless the fetch stored its value.
/// Also covers callers that drop the future mid-fetch.
struct FetchGuard<'a> {
    cache: &'a Mutex<Cache>,
    fingerprint: &'a [u8],
    token: u64,
    armed: bool,
}

impl FetchGuard<'_> {
    fn store(&mut self, value: RespValue, expires_at: Instant) {
        self.armed = false;
        let mut cache = self.cache.lock();
        if !cache.complete(self.fingerprint, self.token, value, expires_at) {
            trace!("cached read raced an invalidation; not stored");
        }
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().abandon(self.fingerprint, self.token);
        }
    }
}

impl Shared {
    /// Moves a request's slots into the FIFO and its bytes into `out`.
    /// Slots are counted as sent while the queue lock is held, so a
    /// concurrent shutdown never abandons more than was counted.
    fn admit(&self, request: Request, out: &mut Vec<u8>) {
        let mut queue = self.queue.lock();
        if queue.closed {
            // Dropping the slots fails their callers.
            return;
        }
        self.stats.record_sent(request.slots.len() as u64);
        queue.slots.extend(request.slots);
        for part in &request.parts {
            out.extend_from_slice(part.as_bytes());
        }
    }

    fn dispatch(&self, frame: RespValue) -> Result<()> {
        match frame {
            RespValue::Push(items) => {
                self.on_push(items);
                Ok(())
            }
            reply => self.complete_front(reply),
        }
    }

    fn complete_front(&self, reply: RespValue) -> Result<()> {
        let slot = self.queue.lock().slots.pop_front();
        match slot {
            Some(slot) => {
                self.stats.record_reply();
                slot.finish(Ok(reply));
                Ok(())
            }
            None => Err(ProtocolError::UnsolicitedReply.into()),
        }
    }

    fn on_push(&self, items: Vec<RespValue>) {
        match notify::classify(&items) {
            Push::Invalidate(keys) => self.invalidate(keys),
            Push::Subscription(sub) => {
                self.confirm_subscription(RespValue::Push(items));
                self.forward(Notification::Subscription(sub));
            }
            Push::Message(msg) => self.forward(Notification::Message(msg)),
            Push::Unknown => trace!(conn = self.id, "ignoring unknown push"),
        }
    }

    fn invalidate(&self, keys: Option<Vec<bytes::Bytes>>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let removed = match keys {
            Some(keys) => cache.lock().invalidate(keys.as_slice()),
            None => cache.lock().flush(),
        };
        trace!(conn = self.id, removed, "applied invalidation");
        self.stats.record_invalidations(removed as u64);
    }

    /// Subscribe-family commands are answered by one push per channel.
    fn confirm_subscription(&self, confirmation: RespValue) {
        let mut queue = self.queue.lock();
        let Some(front) = queue.slots.front_mut() else {
            return;
        };
        if front.acks == 0 {
            return;
        }
        front.acks -= 1;
        front.confirmations.push(confirmation);
        if front.acks > 0 {
            return;
        }
        let slot = queue.slots.pop_front();
        drop(queue);
        if let Some(mut slot) = slot {
            self.stats.record_reply();
            let mut confirmations = std::mem::take(&mut slot.confirmations);
            let reply = if confirmations.len() == 1 {
                confirmations.pop().unwrap_or(RespValue::Null)
            } else {
                RespValue::Array(confirmations)
            };
            slot.finish(Ok(reply));
        }
    }

    fn forward(&self, notification: Notification) {
        if let Some(notify) = &self.notify {
            let _ = notify.send(notification);
        }
    }

    /// Closes the connection once. `cause` is set for failures, `None` for
    /// an explicit close.
    fn shutdown_with(&self, cause: Option<&Error>) {
        let drained = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            std::mem::take(&mut queue.slots)
        };
        self.state.store(ConnState::Closing as u8, Ordering::Release);

        self.stats.record_abandoned(drained.len() as u64);
        for slot in drained {
            slot.finish(Err(Error::ConnectionClosed));
        }
        if let Some(cache) = &self.cache {
            cache.lock().flush();
        }
        let _ = self.shutdown.send(true);
        self.state.store(ConnState::Closed as u8, Ordering::Release);

        match cause {
            Some(err) => {
                self.stats.record_failure();
                warn!(addr = %self.addr, conn = self.id, error = %err, "connection failed");
            }
            None => debug!(addr = %self.addr, conn = self.id, "connection closed"),
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<BoxStream>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut out = Vec::with_capacity(READ_BUF_SIZE);
    loop {
        let first = tokio::select! {
            _ = closed(&mut shutdown) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        out.clear();
        shared.admit(first, &mut out);
        while out.len() < MAX_COALESCE {
            match requests.try_recv() {
                Ok(request) => shared.admit(request, &mut out),
                Err(_) => break,
            }
        }
        if out.is_empty() {
            continue;
        }

        let written = async {
            writer.write_all(&out).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            shared.shutdown_with(Some(&Error::Io(err)));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<BoxStream>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    let mut decoder = Decoder::new();
    let err = loop {
        match drain_frames(&shared, &mut decoder, &mut buf) {
            Ok(()) => {}
            Err(err) => break err,
        }
        let read = tokio::select! {
            _ = closed(&mut shutdown) => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break Error::Io(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {}
            Err(err) => break Error::Io(err),
        }
    };
    shared.shutdown_with(Some(&err));
}

/// Resolves once the shutdown flag is raised.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn drain_frames(shared: &Shared, decoder: &mut Decoder, buf: &mut BytesMut) -> Result<()> {
    while let Some(frame) = decoder.decode(buf)? {
        shared.dispatch(frame)?;
    }
    Ok(())
}
