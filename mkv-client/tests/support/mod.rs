//! In-process RESP3 server for integration tests.
//!
//! Implements just enough of a key-value server: a string store with PTTL,
//! MULTI/EXEC, client tracking with invalidation pushes, pub/sub pushes,
//! CLUSTER SLOTS from a configurable map, and a scripted hook that can
//! answer any command first (used for MOVED/ASK).

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mkv_common::{decode, RespValue};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hook consulted before the built-in handlers. Receives the arguments and
/// whether `ASKING` preceded the command.
pub type Script = Box<dyn FnMut(&[Bytes], bool) -> Option<RespValue> + Send>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bulk(data: &str) -> RespValue {
    RespValue::Bulk(Bytes::copy_from_slice(data.as_bytes()))
}

pub fn simple(data: &str) -> RespValue {
    RespValue::Simple(Bytes::copy_from_slice(data.as_bytes()))
}

pub fn error(data: &str) -> RespValue {
    RespValue::Error(Bytes::copy_from_slice(data.as_bytes()))
}

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    tracked: HashSet<Bytes>,
    tracking: bool,
    channels: HashSet<Bytes>,
}

#[derive(Default)]
struct ServerState {
    store: Mutex<HashMap<Bytes, Bytes>>,
    ttls: Mutex<HashMap<Bytes, i64>>,
    peers: Mutex<HashMap<u64, Peer>>,
    log: Mutex<Vec<(u64, Vec<String>)>>,
    slots: Mutex<Vec<(u16, u16, String)>>,
    script: Mutex<Option<Script>>,
    hello_error: Mutex<Option<String>>,
    accepted: AtomicUsize,
    next_id: AtomicU64,
}

/// Running mock server. Dropping it stops accepting connections.
pub struct MockServer {
    pub addr: String,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl MockServer {
    pub async fn start() -> anyhow::Result<MockServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let id = accept_state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve(Arc::clone(&accept_state), stream, id));
            }
        });

        Ok(MockServer { addr, state, accept })
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Every command received, as lossy strings.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.log.lock().iter().map(|(_, args)| args.clone()).collect()
    }

    /// Number of received commands named `name`.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(_, args)| args.first().map_or(false, |cmd| cmd.eq_ignore_ascii_case(name)))
            .count()
    }

    /// Distinct connections that sent a command named `name`.
    pub fn connections_for(&self, name: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(_, args)| args.first().map_or(false, |cmd| cmd.eq_ignore_ascii_case(name)))
            .map(|(conn, _)| *conn)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.state
            .store
            .lock()
            .insert(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
    }

    /// Changes a key behind the clients' backs, sending invalidations.
    pub fn write(&self, key: &str, value: &str) {
        let key = Bytes::copy_from_slice(key.as_bytes());
        self.state
            .store
            .lock()
            .insert(key.clone(), Bytes::copy_from_slice(value.as_bytes()));
        self.state.invalidate(&key);
    }

    /// Sends a null-payload invalidation (flush) to every tracking client.
    pub fn flush_tracking(&self) {
        self.state.flush_tracking();
    }

    pub fn set_pttl(&self, key: &str, ms: i64) {
        self.state.ttls.lock().insert(Bytes::copy_from_slice(key.as_bytes()), ms);
    }

    pub fn set_slots(&self, slots: Vec<(u16, u16, String)>) {
        *self.state.slots.lock() = slots;
    }

    pub fn set_script(&self, script: Script) {
        *self.state.script.lock() = Some(script);
    }

    pub fn fail_hello(&self, message: &str) {
        *self.state.hello_error.lock() = Some(message.to_string());
    }

    /// Sends a raw frame to every connected client.
    pub fn push_raw(&self, frame: &[u8]) {
        for peer in self.state.peers.lock().values() {
            let _ = peer.tx.send(frame.to_vec());
        }
    }
}

impl ServerState {
    fn invalidate(&self, key: &Bytes) {
        let mut frame = Vec::new();
        RespValue::Push(vec![bulk("invalidate"), RespValue::Array(vec![RespValue::Bulk(key.clone())])])
            .encode(&mut frame);
        for peer in self.peers.lock().values_mut() {
            if peer.tracked.remove(key) {
                let _ = peer.tx.send(frame.clone());
            }
        }
    }

    fn flush_tracking(&self) {
        let mut frame = Vec::new();
        RespValue::Push(vec![bulk("invalidate"), RespValue::Null]).encode(&mut frame);
        for peer in self.peers.lock().values_mut() {
            if peer.tracking {
                peer.tracked.clear();
                let _ = peer.tx.send(frame.clone());
            }
        }
    }

    fn track(&self, conn: u64, key: &Bytes) {
        if let Some(peer) = self.peers.lock().get_mut(&conn) {
            if peer.tracking {
                peer.tracked.insert(key.clone());
            }
        }
    }

    fn send(&self, conn: u64, value: &RespValue) {
        let mut frame = Vec::new();
        value.encode(&mut frame);
        if let Some(peer) = self.peers.lock().get(&conn) {
            let _ = peer.tx.send(frame);
        }
    }
}

/// Per-connection protocol state.
#[derive(Default)]
struct Session {
    caching: bool,
    asking: bool,
    multi: Option<Vec<Vec<Bytes>>>,
}

async fn serve(state: Arc<ServerState>, stream: TcpStream, conn: u64) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.peers.lock().insert(
        conn,
        Peer {
            tx,
            tracked: HashSet::new(),
            tracking: false,
            channels: HashSet::new(),
        },
    );
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut session = Session::default();
    'conn: loop {
        while let Ok(Some(frame)) = decode(&mut buf) {
            let Ok(items) = frame.into_array() else {
                break 'conn;
            };
            let args: Vec<Bytes> = items
                .into_iter()
                .filter_map(|item| item.as_bytes().ok().cloned())
                .collect();
            if !handle(&state, conn, &mut session, args).await {
                break 'conn;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.peers.lock().remove(&conn);
    write_task.abort();
}

/// Returns false when the connection should be dropped.
async fn handle(state: &ServerState, conn: u64, session: &mut Session, args: Vec<Bytes>) -> bool {
    let Some(name) = args.first().map(|name| name.to_ascii_uppercase()) else {
        return true;
    };
    state.log.lock().push((
        conn,
        args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect(),
    ));

    let asking = std::mem::take(&mut session.asking);
    let scripted = match state.script.lock().as_mut() {
        Some(script) => script(&args, asking),
        None => None,
    };
    if let Some(reply) = scripted {
        state.send(conn, &reply);
        return true;
    }

    match name.as_slice() {
        b"CRASH" => return false,
        b"HANG" => return true,
        b"SLEEP" => {
            let ms = arg_i64(&args, 1).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            state.send(conn, &simple("OK"));
            return true;
        }
        b"ASKING" => {
            session.asking = true;
            state.send(conn, &simple("OK"));
            return true;
        }
        b"SUBSCRIBE" => {
            // Answered by one push per channel, no ordinary reply.
            for channel in &args[1..] {
                let count = {
                    let mut peers = state.peers.lock();
                    match peers.get_mut(&conn) {
                        Some(peer) => {
                            peer.channels.insert(channel.clone());
                            peer.channels.len() as i64
                        }
                        None => 0,
                    }
                };
                state.send(
                    conn,
                    &RespValue::Push(vec![
                        bulk("subscribe"),
                        RespValue::Bulk(channel.clone()),
                        RespValue::Integer(count),
                    ]),
                );
            }
            return true;
        }
        _ => {}
    }

    if let Some(queued) = session.multi.as_mut() {
        match name.as_slice() {
            b"EXEC" => {
                let queued = std::mem::take(queued);
                session.multi = None;
                let replies = queued
                    .into_iter()
                    .map(|args| execute(state, conn, session, &args))
                    .collect();
                session.caching = false;
                state.send(conn, &RespValue::Array(replies));
            }
            b"DISCARD" => {
                session.multi = None;
                state.send(conn, &simple("OK"));
            }
            _ => {
                queued.push(args);
                state.send(conn, &simple("QUEUED"));
            }
        }
        return true;
    }

    if name.as_slice() == b"MULTI" {
        session.multi = Some(Vec::new());
        state.send(conn, &simple("OK"));
        return true;
    }

    let arms_caching = name.as_slice() == b"CLIENT" && args.get(1).map_or(false, |sub| sub.eq_ignore_ascii_case(b"CACHING"));
    let reply = execute(state, conn, session, &args);
    if !arms_caching {
        session.caching = false;
    }
    state.send(conn, &reply);
    true
}

fn execute(state: &ServerState, conn: u64, session: &mut Session, args: &[Bytes]) -> RespValue {
    let name = args[0].to_ascii_uppercase();
    let arg = |idx: usize| args.get(idx).cloned().unwrap_or_default();

    match name.as_slice() {
        b"HELLO" => match state.hello_error.lock().clone() {
            Some(message) => error(&message),
            None => RespValue::Map(vec![
                (bulk("server"), bulk("mock")),
                (bulk("proto"), RespValue::Integer(3)),
            ]),
        },
        b"PING" => simple("PONG"),
        b"SELECT" => simple("OK"),
        b"CLIENT" => {
            let sub = arg(1).to_ascii_uppercase();
            match sub.as_slice() {
                b"TRACKING" => {
                    if let Some(peer) = state.peers.lock().get_mut(&conn) {
                        peer.tracking = true;
                    }
                    simple("OK")
                }
                b"CACHING" => {
                    session.caching = true;
                    simple("OK")
                }
                b"ID" => RespValue::Integer(conn as i64),
                _ => simple("OK"),
            }
        }
        b"GET" => {
            let key = arg(1);
            if session.caching {
                state.track(conn, &key);
            }
            match state.store.lock().get(&key) {
                Some(value) => RespValue::Bulk(value.clone()),
                None => RespValue::Null,
            }
        }
        b"MGET" => {
            let store = state.store.lock();
            let values = args[1..]
                .iter()
                .map(|key| {
                    if session.caching {
                        state.track(conn, key);
                    }
                    store.get(key).map_or(RespValue::Null, |value| RespValue::Bulk(value.clone()))
                })
                .collect();
            RespValue::Array(values)
        }
        b"STRLEN" => {
            let key = arg(1);
            if session.caching {
                state.track(conn, &key);
            }
            RespValue::Integer(state.store.lock().get(&key).map_or(0, |v| v.len() as i64))
        }
        b"PTTL" => {
            let key = arg(1);
            if !state.store.lock().contains_key(&key) {
                RespValue::Integer(-2)
            } else {
                RespValue::Integer(state.ttls.lock().get(&key).copied().unwrap_or(-1))
            }
        }
        b"SET" => {
            let key = arg(1);
            state.store.lock().insert(key.clone(), arg(2));
            state.invalidate(&key);
            simple("OK")
        }
        b"DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if state.store.lock().remove(key).is_some() {
                    removed += 1;
                }
                state.invalidate(key);
            }
            RespValue::Integer(removed)
        }
        b"INCR" => {
            let key = arg(1);
            let next = {
                let mut store = state.store.lock();
                let current = store
                    .get(&key)
                    .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                    .unwrap_or(0);
                store.insert(key.clone(), Bytes::from((current + 1).to_string()));
                current + 1
            };
            state.invalidate(&key);
            RespValue::Integer(next)
        }
        b"PUBLISH" => {
            let channel = arg(1);
            let mut frame = Vec::new();
            RespValue::Push(vec![bulk("message"), RespValue::Bulk(channel.clone()), RespValue::Bulk(arg(2))])
                .encode(&mut frame);
            let mut receivers = 0;
            for peer in state.peers.lock().values() {
                if peer.channels.contains(&channel) {
                    receivers += 1;
                    let _ = peer.tx.send(frame.clone());
                }
            }
            RespValue::Integer(receivers)
        }
        b"CLUSTER" => RespValue::Array(
            state
                .slots
                .lock()
                .iter()
                .map(|(start, end, addr)| {
                    let (host, port) = addr.rsplit_once(':').unwrap_or((addr.as_str(), "0"));
                    RespValue::Array(vec![
                        RespValue::Integer(*start as i64),
                        RespValue::Integer(*end as i64),
                        RespValue::Array(vec![
                            bulk(host),
                            RespValue::Integer(port.parse().unwrap_or(0)),
                            bulk("mock-node"),
                        ]),
                    ])
                })
                .collect(),
        ),
        _ => error(&format!("ERR unknown command '{}'", String::from_utf8_lossy(&args[0]))),
    }
}

fn arg_i64(args: &[Bytes], idx: usize) -> Option<i64> {
    std::str::from_utf8(args.get(idx)?).ok()?.parse().ok()
}
