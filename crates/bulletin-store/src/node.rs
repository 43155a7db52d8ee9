//! Nodes, stored entries, and watch events.

use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// A key with its value, metadata, and (for listings) its children.
///
/// A node can carry a value and children at the same time, e.g.
/// `/v1/actual/p/0` next to `/v1/actual/p/0/evacuating`. `dir` is set
/// only for pure directories implied by deeper keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: Vec<u8>,
    /// On writes, how long the key lives. On reads, the time remaining.
    pub ttl: Option<Duration>,
    /// Modification index of the last write to this key.
    pub index: u64,
    pub dir: bool,
    pub nodes: Vec<StoreNode>,
}

impl StoreNode {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: normalize(&key.into()).to_string(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Attach a TTL. A zero TTL means the key never expires.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    fn dir(key: &str) -> Self {
        Self {
            key: key.to_string(),
            dir: true,
            ..Default::default()
        }
    }

    /// Every node in this subtree that carries a value, depth first.
    pub fn values(&self) -> Vec<&StoreNode> {
        let mut out = Vec::new();
        self.collect_values(&mut out);
        out
    }

    fn collect_values<'a>(&'a self, out: &mut Vec<&'a StoreNode>) {
        if !self.dir {
            out.push(self);
        }
        for child in &self.nodes {
            child.collect_values(out);
        }
    }

    /// Direct child with the given full key.
    pub fn child(&self, key: &str) -> Option<&StoreNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Insert `leaf` below this node, creating implied directories.
    pub(crate) fn insert(&mut self, leaf: StoreNode) {
        let rest = match leaf.key.strip_prefix(self.key.as_str()) {
            Some(rest) => rest.trim_start_matches('/'),
            None => return,
        };
        if rest.is_empty() {
            self.value = leaf.value;
            self.ttl = leaf.ttl;
            self.index = leaf.index;
            self.dir = false;
            return;
        }

        let segment = rest.split('/').next().unwrap_or(rest);
        let child_key = join(&self.key, segment);
        let pos = match self.nodes.iter().position(|n| n.key == child_key) {
            Some(pos) => pos,
            None => {
                self.nodes.push(StoreNode::dir(&child_key));
                self.nodes.len() - 1
            }
        };
        self.nodes[pos].insert(leaf);
    }
}

/// Construct the tree rooted at `root` from sorted live entries.
pub(crate) fn build_tree(root: &str, leaves: Vec<StoreNode>) -> StoreNode {
    let mut tree = StoreNode::dir(root);
    for leaf in leaves {
        tree.insert(leaf);
    }
    tree
}

// ── Stored entry encoding ─────────────────────────────────────────

const HEADER_LEN: usize = 16;

/// What is physically stored per key: a 16-byte header (modification
/// index, absolute expiry in Unix nanos or 0) and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub index: u64,
    pub expires_at: i64,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.value.len());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.expires_at.to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(key: &str, raw: &[u8]) -> StoreResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(StoreError::Backend(format!("truncated entry at {key}")));
        }
        let (index, rest) = raw.split_at(8);
        let (expires, value) = rest.split_at(8);
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(index);
        let mut expires_bytes = [0u8; 8];
        expires_bytes.copy_from_slice(expires);
        Ok(Self {
            index: u64::from_be_bytes(index_bytes),
            expires_at: i64::from_be_bytes(expires_bytes),
            value: value.to_vec(),
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }

    pub fn into_node(self, key: &str, now: i64) -> StoreNode {
        let ttl = (self.expires_at != 0)
            .then(|| Duration::from_nanos(self.expires_at.saturating_sub(now).max(0) as u64));
        StoreNode {
            key: key.to_string(),
            value: self.value,
            ttl,
            index: self.index,
            dir: false,
            nodes: Vec::new(),
        }
    }
}

// ── Watch events ──────────────────────────────────────────────────

/// A change observed by a watch subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Create(StoreNode),
    Update { prev: StoreNode, node: StoreNode },
    /// Carries the last value the key held.
    Delete(StoreNode),
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Create(node) | WatchEvent::Delete(node) => &node.key,
            WatchEvent::Update { node, .. } => &node.key,
        }
    }
}

// ── Key paths ─────────────────────────────────────────────────────

/// Strip trailing separators; the root stays `/`.
pub fn normalize(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// Whether `key` is `prefix` itself or lies beneath it.
pub fn is_within(key: &str, prefix: &str) -> bool {
    let prefix = normalize(prefix);
    if prefix == "/" {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// The directory prefix that every descendant of `key` starts with.
pub(crate) fn descendant_prefix(key: &str) -> String {
    let key = normalize(key);
    if key == "/" {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

fn join(parent: &str, segment: &str) -> String {
    if parent == "/" {
        format!("/{segment}")
    } else {
        format!("{parent}/{segment}")
    }
}
