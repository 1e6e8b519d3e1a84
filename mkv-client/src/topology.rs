//! Cluster slot map and redirect parsing.
//!
//! A [`Topology`] is never mutated once published; updates build a new one
//! and swap the `Arc` so readers always see a whole map.

use mkv_common::{Error, RespValue, Result, SLOT_COUNT};

use crate::transport::split_addr;

const UNASSIGNED: u16 = u16::MAX;

/// Slot number to node address mapping.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<String>,
    /// Index into `nodes` per slot, `UNASSIGNED` when nobody serves it.
    owners: Vec<u16>,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            nodes: Vec::new(),
            owners: vec![UNASSIGNED; SLOT_COUNT as usize],
        }
    }
}

impl Topology {
    /// Builds a map from inclusive `(start, end, addr)` ranges.
    pub fn from_ranges<S: AsRef<str>>(ranges: &[(u16, u16, S)]) -> Topology {
        let mut topology = Topology::default();
        for (start, end, addr) in ranges {
            topology.assign(*start, *end, addr.as_ref());
        }
        topology
    }

    /// Parses a `CLUSTER SLOTS` reply received from `queried`.
    ///
    /// Only primaries are used. An empty host means "the node you asked".
    pub fn from_cluster_slots(reply: &RespValue, queried: &str) -> Result<Topology> {
        let (queried_host, _) = split_addr(queried)?;
        let mut topology = Topology::default();

        for range in reply.as_array()? {
            let fields = range.as_array()?;
            if fields.len() < 3 {
                return Err(Error::Topology("short CLUSTER SLOTS entry".to_string()));
            }
            let start = slot_number(&fields[0])?;
            let end = slot_number(&fields[1])?;
            if start > end {
                return Err(Error::Topology(format!("invalid slot range {}-{}", start, end)));
            }

            let primary = fields[2].as_array()?;
            if primary.len() < 2 {
                return Err(Error::Topology("missing primary address".to_string()));
            }
            let host = match &primary[0] {
                RespValue::Null => "",
                other => other.as_str()?,
            };
            let host = if host.is_empty() || host == "?" {
                queried_host
            } else {
                host
            };
            let port = primary[1].as_i64()?;
            topology.assign(start, end, &join_addr(host, port));
        }
        Ok(topology)
    }

    /// Owner of `slot`, if any.
    pub fn node_for_slot(&self, slot: u16) -> Option<&str> {
        let owner = *self.owners.get(slot as usize)?;
        if owner == UNASSIGNED {
            return None;
        }
        self.nodes.get(owner as usize).map(String::as_str)
    }

    /// Every node owning at least one slot.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.nodes.iter().any(|node| node == addr)
    }

    /// Number of slots with a known owner.
    pub fn assigned_slots(&self) -> usize {
        self.owners.iter().filter(|owner| **owner != UNASSIGNED).count()
    }

    /// Copy of this map with `slot` moved to `addr`.
    pub fn with_slot(&self, slot: u16, addr: &str) -> Topology {
        let mut next = self.clone();
        next.assign(slot, slot, addr);
        next.prune();
        next
    }

    fn assign(&mut self, start: u16, end: u16, addr: &str) {
        let end = end.min(SLOT_COUNT - 1);
        if start > end {
            return;
        }
        let idx = match self.nodes.iter().position(|node| node == addr) {
            Some(idx) => idx,
            None => {
                self.nodes.push(addr.to_string());
                self.nodes.len() - 1
            }
        };
        let idx = idx as u16;
        for owner in &mut self.owners[start as usize..=end as usize] {
            *owner = idx;
        }
    }

    /// Drops nodes that no longer own any slot.
    fn prune(&mut self) {
        let mut used = vec![false; self.nodes.len()];
        for &owner in &self.owners {
            if owner != UNASSIGNED {
                used[owner as usize] = true;
            }
        }
        if used.iter().all(|u| *u) {
            return;
        }

        let mut remap = vec![UNASSIGNED; self.nodes.len()];
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.drain(..).enumerate() {
            if used[idx] {
                remap[idx] = nodes.len() as u16;
                nodes.push(node);
            }
        }
        for owner in &mut self.owners {
            if *owner != UNASSIGNED {
                *owner = remap[*owner as usize];
            }
        }
        self.nodes = nodes;
    }
}

fn slot_number(value: &RespValue) -> Result<u16> {
    let slot = value.as_i64()?;
    if !(0..SLOT_COUNT as i64).contains(&slot) {
        return Err(Error::Topology(format!("slot {} out of range", slot)));
    }
    Ok(slot as u16)
}

fn join_addr(host: &str, port: i64) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Kind of cluster redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Slot permanently moved; update the map.
    Moved,
    /// Slot migrating; retry once with `ASKING`, map unchanged.
    Ask,
}

/// Redirect parsed from a `MOVED`/`ASK` error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub addr: String,
}

impl Redirect {
    /// Parses replies like `MOVED 3999 127.0.0.1:7001`. `from` supplies the
    /// host when the reply leaves it empty (`MOVED 3999 :7001`).
    pub fn parse(reply: &RespValue, from: &str) -> Option<Redirect> {
        let message = std::str::from_utf8(reply.error_message()?).ok()?;
        let mut parts = message.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot = parts.next()?.parse::<u16>().ok().filter(|slot| *slot < SLOT_COUNT)?;
        let target = parts.next()?;

        let addr = match target.strip_prefix(':') {
            Some(port) => {
                let (host, _) = split_addr(from).ok()?;
                join_addr(host, port.parse().ok()?)
            }
            None => target.to_string(),
        };
        Some(Redirect { kind, slot, addr })
    }
}
