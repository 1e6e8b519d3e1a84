//! # Command Encoding
//!
//! Purpose: Build requests once, as a finished RESP array of bulk strings,
//! and recycle their buffers after use.
//!
//! ## Design Principles
//! 1. **Encode Once**: `CommandWriter` appends each argument as it arrives;
//!    the array header is written into reserved space at `build` time, so
//!    nothing is copied afterwards.
//! 2. **Object Pool Pattern**: Buffers come from a `BufferPool` of
//!    power-of-two size classes and go back to it when the command drops.
//! 3. **Shared, Not Copied**: The encoded bytes live behind an `Arc` so the
//!    writer task can hold them without cloning the payload.
//!
//! ## Layout
//!
//! ```text
//! buf: [ reserved .... | *3\r\n | $3\r\nGET\r\n | $1\r\nk\r\n ... ]
//!                       ^ start
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::resp::{push_bulk_arg, push_usize};
use crate::slot::hash_slot;

/// Room reserved in front of the arguments for `*<argc>\r\n`.
const HEADER_RESERVE: usize = 24;

/// Smallest size class is 64 bytes.
const MIN_CLASS_SHIFT: u32 = 6;

/// Size classes 64 B, 128 B, ... 64 KiB.
const CLASS_COUNT: usize = 11;

/// Buffers retained per size class.
const DEFAULT_RETAIN: usize = 64;

/// Commands whose replies arrive as push confirmations under RESP3.
const PUBSUB_COMMANDS: [&[u8]; 6] = [
    b"SUBSCRIBE",
    b"PSUBSCRIBE",
    b"SSUBSCRIBE",
    b"UNSUBSCRIBE",
    b"PUNSUBSCRIBE",
    b"SUNSUBSCRIBE",
];

/// Arena of reusable encode buffers, indexed by size class.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    retain: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Creates a pool that keeps up to 64 buffers per class.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAIN)
    }

    /// Creates a pool that keeps up to `retain` buffers per class.
    pub fn with_retention(retain: usize) -> Self {
        BufferPool {
            classes: (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            retain,
        }
    }

    /// Returns an empty buffer with at least `hint` bytes of capacity.
    pub fn get(&self, hint: usize) -> Vec<u8> {
        match request_class(hint) {
            Some(class) => self.classes[class]
                .lock()
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(class_size(class))),
            None => Vec::with_capacity(hint),
        }
    }

    /// Hands a buffer back. Buffers outside the class range are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        let Some(class) = storage_class(buf.capacity()) else {
            return;
        };
        buf.clear();
        let mut free = self.classes[class].lock();
        if free.len() < self.retain {
            free.push(buf);
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn retained(&self) -> usize {
        self.classes.iter().map(|class| class.lock().len()).sum()
    }
}

fn class_size(class: usize) -> usize {
    1 << (MIN_CLASS_SHIFT as usize + class)
}

/// Smallest class whose buffers fit `hint` bytes.
fn request_class(hint: usize) -> Option<usize> {
    let size = hint.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    let class = (size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
    (class < CLASS_COUNT).then_some(class)
}

/// Largest class a buffer of `capacity` bytes can serve.
fn storage_class(capacity: usize) -> Option<usize> {
    if capacity < (1 << MIN_CLASS_SHIFT) {
        return None;
    }
    let class = (usize::BITS - 1 - capacity.leading_zeros() - MIN_CLASS_SHIFT) as usize;
    (class < CLASS_COUNT).then_some(class)
}

/// How a builder treats key arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    /// Single-node clients never need slots.
    NoSlot,
    /// Cluster clients compute and cross-check slots of every key.
    Compute,
}

/// Shared view of an encoded request, handed to the writer task.
#[derive(Debug, Clone)]
pub struct Encoded {
    buf: Arc<Vec<u8>>,
    start: usize,
}

impl Encoded {
    /// The RESP bytes of the request.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

/// One encoded request plus its routing metadata.
#[derive(Debug, Clone)]
pub struct Command {
    buf: Option<Arc<Vec<u8>>>,
    start: usize,
    keys: Vec<Bytes>,
    slot: Option<u16>,
    cross_slot: bool,
    cacheable: bool,
    push_acks: usize,
    pool: Option<Arc<BufferPool>>,
}

impl Command {
    /// Encodes a command without routing metadata or pooling.
    pub fn from_args(args: &[&[u8]]) -> Self {
        let mut buf = Vec::with_capacity(args.iter().map(|a| a.len() + 16).sum::<usize>() + 16);
        crate::resp::encode_args(args, &mut buf);
        Command {
            buf: Some(Arc::new(buf)),
            start: 0,
            keys: Vec::new(),
            slot: None,
            cross_slot: false,
            cacheable: false,
            push_acks: args.first().map_or(0, |name| pubsub_acks(name, args.len() - 1)),
            pool: None,
        }
    }

    /// The RESP bytes of the request. Also the cache fingerprint.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.start..],
            None => &[],
        }
    }

    /// Shared handle on the encoded bytes.
    pub fn encoded(&self) -> Encoded {
        Encoded {
            buf: self.buf.clone().unwrap_or_default(),
            start: self.start,
        }
    }

    /// First key argument, used for routing and TTL lookup.
    pub fn key(&self) -> Option<&Bytes> {
        self.keys.first()
    }

    /// Every key argument in the order it was appended.
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    /// Hash slot of the keys; `None` for keyless commands or `SlotMode::NoSlot`.
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    /// True when keys of this command hash to different slots.
    pub fn is_cross_slot(&self) -> bool {
        self.cross_slot
    }

    /// True when the command was marked eligible for client-side caching.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Number of push confirmations this command is answered with.
    /// Zero for ordinary commands.
    pub fn push_acks(&self) -> usize {
        self.push_acks
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let (Some(pool), Some(buf)) = (self.pool.take(), self.buf.take()) {
            if let Ok(buf) = Arc::try_unwrap(buf) {
                pool.put(buf);
            }
        }
    }
}

fn pubsub_acks(name: &[u8], channels: usize) -> usize {
    if PUBSUB_COMMANDS.iter().any(|cmd| cmd.eq_ignore_ascii_case(name)) {
        channels.max(1)
    } else {
        0
    }
}

/// Entry point for building commands against a shared buffer pool.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pool: Arc<BufferPool>,
    mode: SlotMode,
}

impl CommandBuilder {
    /// Creates a builder with its own buffer pool.
    pub fn new(mode: SlotMode) -> Self {
        Self::with_pool(Arc::new(BufferPool::new()), mode)
    }

    /// Creates a builder over an existing pool.
    pub fn with_pool(pool: Arc<BufferPool>, mode: SlotMode) -> Self {
        CommandBuilder { pool, mode }
    }

    /// Starts a command with the given name.
    pub fn cmd(&self, name: impl AsRef<[u8]>) -> CommandWriter {
        let name = name.as_ref();
        let mut buf = self.pool.get(HEADER_RESERVE + name.len() + 64);
        buf.resize(HEADER_RESERVE, 0);
        push_bulk_arg(&mut buf, name);
        CommandWriter {
            buf,
            argc: 1,
            keys: Vec::new(),
            slot: None,
            cross_slot: false,
            cacheable: false,
            pubsub: pubsub_acks(name, 1) > 0,
            mode: self.mode,
            pool: Arc::clone(&self.pool),
        }
    }

    /// The pool commands return their buffers to.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Slot handling of this builder.
    pub fn mode(&self) -> SlotMode {
        self.mode
    }
}

/// In-progress command. Arguments are encoded as they are appended.
#[derive(Debug)]
pub struct CommandWriter {
    buf: Vec<u8>,
    argc: usize,
    keys: Vec<Bytes>,
    slot: Option<u16>,
    cross_slot: bool,
    cacheable: bool,
    pubsub: bool,
    mode: SlotMode,
    pool: Arc<BufferPool>,
}

impl CommandWriter {
    /// Appends a plain argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        push_bulk_arg(&mut self.buf, arg.as_ref());
        self.argc += 1;
        self
    }

    /// Appends several plain arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Appends a key argument. The first key becomes the routing key; all
    /// of them index cached replies for invalidation.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        let key = key.as_ref();
        if self.mode == SlotMode::Compute {
            let slot = hash_slot(key);
            match self.slot {
                Some(existing) if existing != slot => self.cross_slot = true,
                Some(_) => {}
                None => self.slot = Some(slot),
            }
        }
        self.keys.push(Bytes::copy_from_slice(key));
        self.arg(key)
    }

    /// Marks the command as eligible for `execute_cached`.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Writes the array header and finishes the command.
    pub fn build(mut self) -> Command {
        let mut header = Vec::with_capacity(HEADER_RESERVE);
        header.push(b'*');
        push_usize(&mut header, self.argc);
        header.extend_from_slice(b"\r\n");
        let start = HEADER_RESERVE - header.len();
        self.buf[start..HEADER_RESERVE].copy_from_slice(&header);

        let push_acks = if self.pubsub { (self.argc - 1).max(1) } else { 0 };
        Command {
            buf: Some(Arc::new(std::mem::take(&mut self.buf))),
            start,
            keys: std::mem::take(&mut self.keys),
            slot: self.slot,
            cross_slot: self.cross_slot,
            cacheable: self.cacheable,
            push_acks,
            pool: Some(Arc::clone(&self.pool)),
        }
    }
}
