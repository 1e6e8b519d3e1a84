//! # Client-Side Cache
//!
//! Per-connection store of cached read replies, kept coherent by the
//! server's invalidation pushes.
//!
//! ## Design Principles
//!
//! 1. **Byte-Based LRU**: Evict least-recently used entries once the byte
//!    budget is exceeded.
//! 2. **Index-Based Arena**: Entries live in a dense `Vec` and link to each
//!    other by index, so LRU updates are O(1) without pointers or `unsafe`.
//! 3. **TTL Fast Path**: Expiration is checked on lookup; there is no sweeper.
//! 4. **Pending Markers**: A miss leaves a marker that concurrent readers wait
//!    on. Invalidation removes the marker, which is how a fetch that raced
//!    an invalidation learns it must not store its reply.
//!
//! ## Structure Overview
//!
//! ```text
//! Cache
//!   ├── map:  fingerprint -> node index
//!   ├── keys: key argument -> node indices (invalidation fan-out)
//!   ├── nodes: Vec<Option<Node>>
//!   ├── free: Vec<usize>
//!   └── head/tail: LRU indices
//!         └── Node { fingerprint, keys, state, size, prev, next }
//! ```

use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use hashbrown::HashMap;
use mkv_common::RespValue;
use tokio::sync::oneshot;

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Fresh value, served without I/O.
    Hit(RespValue),
    /// Another caller is fetching; its reply arrives here. A closed channel
    /// means that fetch was abandoned or invalidated.
    Pending(oneshot::Receiver<RespValue>),
    /// Nothing usable; the caller owns the fetch identified by the token.
    Miss(u64),
}

#[derive(Debug)]
enum EntryState {
    Pending {
        token: u64,
        waiters: Vec<oneshot::Sender<RespValue>>,
    },
    Ready {
        value: RespValue,
        expires_at: Instant,
    },
}

#[derive(Debug)]
struct Node {
    fingerprint: Arc<[u8]>,
    keys: Box<[Arc<[u8]>]>,
    state: EntryState,
    // Byte size for eviction accounting.
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn is_expired(&self, now: Instant) -> bool {
        match &self.state {
            EntryState::Ready { expires_at, .. } => now >= *expires_at,
            EntryState::Pending { .. } => false,
        }
    }
}

/// Byte-bounded LRU of cached replies for one connection.
#[derive(Debug)]
pub struct Cache {
    map: HashMap<Arc<[u8]>, usize, RandomState>,
    keys: HashMap<Arc<[u8]>, Vec<usize>, RandomState>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// LRU head (oldest) and tail (most recent).
    head: Option<usize>,
    tail: Option<usize>,
    used_bytes: usize,
    max_bytes: usize,
    next_token: u64,
}

impl Cache {
    /// Creates an empty cache bounded to `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        let hash_state = RandomState::new();
        Cache {
            map: HashMap::with_hasher(hash_state.clone()),
            keys: HashMap::with_hasher(hash_state),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            used_bytes: 0,
            max_bytes,
            next_token: 0,
        }
    }

    /// Number of entries, pending ones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bytes currently accounted to entries.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Looks up a fingerprint.
    ///
    /// Expired entries are dropped on the spot. On a miss a pending marker is
    /// inserted under every one of `keys` and the caller must finish with
    /// [`Cache::complete`] or [`Cache::abandon`].
    pub fn lookup<K: AsRef<[u8]>>(&mut self, fingerprint: &[u8], keys: &[K], now: Instant) -> Lookup {
        if let Some(&idx) = self.map.get(fingerprint) {
            let expired = self.nodes[idx].as_ref().map_or(true, |node| node.is_expired(now));
            if expired {
                self.remove_idx(idx);
            } else {
                self.touch(idx);
                if let Some(node) = self.nodes[idx].as_mut() {
                    match &mut node.state {
                        EntryState::Ready { value, .. } => return Lookup::Hit(value.clone()),
                        EntryState::Pending { waiters, .. } => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            return Lookup::Pending(rx);
                        }
                    }
                }
            }
        }

        self.next_token += 1;
        let token = self.next_token;
        let keys: Box<[Arc<[u8]>]> = keys.iter().map(|key| Arc::from(key.as_ref())).collect();
        let size = fingerprint.len() + key_bytes(&keys);
        self.insert_new(
            Arc::from(fingerprint),
            keys,
            EntryState::Pending {
                token,
                waiters: Vec::new(),
            },
            size,
        );
        self.evict_if_needed();
        Lookup::Miss(token)
    }

    /// Stores the reply of the fetch identified by `token`.
    ///
    /// Returns false when the pending marker is gone (invalidated, flushed or
    /// evicted in the meantime); the reply is then not cached.
    pub fn complete(&mut self, fingerprint: &[u8], token: u64, value: RespValue, expires_at: Instant) -> bool {
        let Some(&idx) = self.map.get(fingerprint) else {
            return false;
        };
        let Some(node) = self.nodes[idx].as_mut() else {
            return false;
        };
        let waiters = match &mut node.state {
            EntryState::Pending { token: current, waiters } if *current == token => std::mem::take(waiters),
            _ => return false,
        };

        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
        let old_size = node.size;
        let new_size = node.fingerprint.len() + key_bytes(&node.keys) + value.weight();
        node.size = new_size;
        node.state = EntryState::Ready { value, expires_at };

        self.used_bytes = self.used_bytes - old_size + new_size;
        self.touch(idx);
        self.evict_if_needed();
        true
    }

    /// Drops the pending marker of a failed fetch, releasing its waiters.
    pub fn abandon(&mut self, fingerprint: &[u8], token: u64) {
        let Some(&idx) = self.map.get(fingerprint) else {
            return;
        };
        let matches = matches!(
            self.nodes[idx].as_ref().map(|node| &node.state),
            Some(EntryState::Pending { token: current, .. }) if *current == token
        );
        if matches {
            self.remove_idx(idx);
        }
    }

    /// Removes every entry whose command referenced one of `keys`.
    pub fn invalidate<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> usize {
        let mut removed = 0;
        for key in keys {
            while let Some(&idx) = self.keys.get(key.as_ref()).and_then(|list| list.last()) {
                self.remove_idx(idx);
                removed += 1;
            }
        }
        removed
    }

    /// Drops every entry. Pending waiters are released.
    pub fn flush(&mut self) -> usize {
        let removed = self.map.len();
        self.map.clear();
        self.keys.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.used_bytes = 0;
        removed
    }

    fn insert_new(&mut self, fingerprint: Arc<[u8]>, keys: Box<[Arc<[u8]>]>, state: EntryState, size: usize) -> usize {
        let idx = self.free.pop().unwrap_or_else(|| {
            self.nodes.push(None);
            self.nodes.len() - 1
        });

        for key in keys.iter() {
            let list = self.keys.entry(Arc::clone(key)).or_default();
            if !list.contains(&idx) {
                list.push(idx);
            }
        }
        self.nodes[idx] = Some(Node {
            fingerprint: Arc::clone(&fingerprint),
            keys,
            state,
            size,
            prev: None,
            next: None,
        });
        self.lru_push_back(idx);
        self.map.insert(fingerprint, idx);
        self.used_bytes += size;
        idx
    }

    /// Removes a node by index, unlinking it from every index.
    fn remove_idx(&mut self, idx: usize) -> Option<usize> {
        // Detach before clearing the slot so LRU links stay valid.
        self.lru_remove(idx);
        let node = self.nodes[idx].take()?;
        self.map.remove(node.fingerprint.as_ref());
        for key in node.keys.iter() {
            if let Some(list) = self.keys.get_mut(key.as_ref()) {
                list.retain(|&other| other != idx);
                if list.is_empty() {
                    self.keys.remove(key.as_ref());
                }
            }
        }
        let size = node.size;
        self.free.push(idx);
        self.used_bytes -= size;
        Some(size)
    }

    fn evict_if_needed(&mut self) {
        while self.used_bytes > self.max_bytes {
            let Some(idx) = self.head else {
                break;
            };
            self.remove_idx(idx);
        }
    }

    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        if let Some(prev_idx) = prev {
            if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                prev_node.next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_idx) = next {
            if let Some(next_node) = self.nodes[next_idx].as_mut() {
                next_node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn lru_push_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }

        if let Some(tail_idx) = tail {
            if let Some(tail_node) = self.nodes[tail_idx].as_mut() {
                tail_node.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }

        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_back(idx);
    }
}

fn key_bytes(keys: &[Arc<[u8]>]) -> usize {
    keys.iter().map(|key| key.len()).sum()
}
