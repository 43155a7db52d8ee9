//! The KV gateway contract and its redb-backed implementation.
//!
//! Keys are `/`-separated paths in one flat redb table; listing rebuilds
//! the hierarchy. Every write transaction bumps a store-wide modification
//! index and stamps it on the nodes it writes, which is what
//! `compare_and_swap_by_index` compares against. TTL expiry is lazy:
//! expired entries read as absent and are physically removed by
//! [`KvStore::purge_expired`] or by the next write to the same key.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use bulletin_core::clock::{Clock, SystemClock, duration_nanos};
use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::node::{Entry, StoreNode, WatchEvent, build_tree, descendant_prefix, normalize};
use crate::tables::{ENTRIES, INDEX_KEY, META};
use crate::watch::{DEFAULT_WATCH_BUFFER, Watch, WatchRegistry};

/// Convert any `Display` error into a `StoreError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Strongly consistent hierarchical key/value operations.
///
/// All calls are synchronous and short; callers on an async runtime may
/// invoke them directly or move batches onto a blocking thread.
pub trait KvStore: Clone + Send + Sync + 'static {
    /// The node at `key` without its children.
    fn get(&self, key: &str) -> StoreResult<StoreNode>;

    /// The subtree rooted at `key`. An empty directory node when nothing
    /// lives there.
    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode>;

    /// Write `node` only if its key holds no value.
    fn create(&self, node: StoreNode) -> StoreResult<StoreNode>;

    /// Write `node` unconditionally.
    fn set(&self, node: StoreNode) -> StoreResult<StoreNode>;

    /// Write every node in one transaction.
    fn set_multi(&self, nodes: Vec<StoreNode>) -> StoreResult<()>;

    /// Replace the value at `prev.key` if it still equals `prev.value`.
    fn compare_and_swap(&self, prev: &StoreNode, node: StoreNode) -> StoreResult<StoreNode>;

    /// Replace the value at `node.key` if it was last written at `prev_index`.
    fn compare_and_swap_by_index(&self, prev_index: u64, node: StoreNode)
    -> StoreResult<StoreNode>;

    /// Delete the value at `prev.key` if it still equals `prev.value`.
    fn compare_and_delete(&self, prev: &StoreNode) -> StoreResult<()>;

    /// Delete the value at `key` if it was last written at `prev_index`.
    /// Children of `key` are left in place.
    fn compare_and_delete_by_index(&self, prev_index: u64, key: &str) -> StoreResult<()>;

    /// Delete each key and everything beneath it.
    ///
    /// Keys that exist are removed even when others are missing; the
    /// first missing key is then reported as `KeyNotFound`.
    fn delete(&self, keys: &[&str]) -> StoreResult<()>;

    /// Delete each key's own value unless it has children.
    fn delete_leaves(&self, keys: &[&str]) -> StoreResult<()>;

    /// Subscribe to every change at or below `prefix`.
    fn watch(&self, prefix: &str) -> StoreResult<Watch>;

    /// Physically remove expired entries. Returns how many were removed.
    fn purge_expired(&self) -> StoreResult<usize>;
}

/// Thread-safe KV store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    watches: WatchRegistry,
    /// Held from transaction start until watchers have been notified, so
    /// events reach subscribers in commit order.
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Per-transaction scratch: the index being assigned, the instant used for
/// TTL math, and the changes to publish after commit.
struct Batch {
    index: u64,
    now: i64,
    changes: Vec<WatchEvent>,
}

type EntryTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "kv store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory kv store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
            watches: WatchRegistry::new(DEFAULT_WATCH_BUFFER),
            write_lock: Arc::new(Mutex::new(())),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Use a different time source for TTL expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the per-watch event buffer. Only affects later subscriptions.
    pub fn with_watch_buffer(mut self, buffer: usize) -> Self {
        self.watches = WatchRegistry::new(buffer);
        self
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
        txn.open_table(META).map_err(map_err!(Backend))?;
        txn.commit().map_err(map_err!(Backend))?;
        Ok(())
    }

    // ── Transaction plumbing ──────────────────────────────────────

    /// Run `f` inside a write transaction.
    ///
    /// Commits and publishes only when `f` succeeds and recorded at least
    /// one change; otherwise the transaction is dropped.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut EntryTable<'_>, &mut Batch) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;

        let mut batch = {
            let meta = txn.open_table(META).map_err(map_err!(Backend))?;
            let last = meta
                .get(INDEX_KEY)
                .map_err(map_err!(Backend))?
                .map(|g| g.value())
                .unwrap_or(0);
            Batch {
                index: last + 1,
                now: self.clock.now(),
                changes: Vec::new(),
            }
        };

        let out = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
            f(&mut table, &mut batch)?
        };

        if batch.changes.is_empty() {
            txn.abort().map_err(map_err!(Backend))?;
            return Ok(out);
        }

        {
            let mut meta = txn.open_table(META).map_err(map_err!(Backend))?;
            meta.insert(INDEX_KEY, batch.index)
                .map_err(map_err!(Backend))?;
        }
        txn.commit().map_err(map_err!(Backend))?;
        self.watches.publish(&batch.changes);
        Ok(out)
    }

    /// The live entry at `key`. An expired entry is removed and reported
    /// as deleted.
    fn load(table: &mut EntryTable<'_>, batch: &mut Batch, key: &str) -> StoreResult<Option<Entry>> {
        let raw = table
            .get(key)
            .map_err(map_err!(Backend))?
            .map(|g| g.value().to_vec());
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry = Entry::decode(key, &raw)?;
        if entry.is_expired(batch.now) {
            table.remove(key).map_err(map_err!(Backend))?;
            batch
                .changes
                .push(WatchEvent::Delete(entry.into_node(key, batch.now)));
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn store(
        table: &mut EntryTable<'_>,
        batch: &mut Batch,
        node: StoreNode,
        prev: Option<Entry>,
    ) -> StoreResult<StoreNode> {
        let key = normalize(&node.key).to_string();
        let expires_at = node
            .ttl
            .map(|ttl| batch.now.saturating_add(duration_nanos(ttl)))
            .unwrap_or(0);
        let entry = Entry {
            index: batch.index,
            expires_at,
            value: node.value,
        };
        table
            .insert(key.as_str(), entry.encode().as_slice())
            .map_err(map_err!(Backend))?;

        let written = entry.into_node(&key, batch.now);
        batch.changes.push(match prev {
            None => WatchEvent::Create(written.clone()),
            Some(prev) => WatchEvent::Update {
                prev: prev.into_node(&key, batch.now),
                node: written.clone(),
            },
        });
        Ok(written)
    }

    fn remove(
        table: &mut EntryTable<'_>,
        batch: &mut Batch,
        key: &str,
        prev: Entry,
    ) -> StoreResult<()> {
        table.remove(key).map_err(map_err!(Backend))?;
        batch
            .changes
            .push(WatchEvent::Delete(prev.into_node(key, batch.now)));
        Ok(())
    }

    /// Keys strictly beneath `key`, in order.
    fn descendant_keys(table: &EntryTable<'_>, key: &str) -> StoreResult<Vec<String>> {
        let prefix = descendant_prefix(key);
        let mut keys = Vec::new();
        for item in table.range(prefix.as_str()..).map_err(map_err!(Backend))? {
            let (k, _) = item.map_err(map_err!(Backend))?;
            let k = k.value();
            if !k.starts_with(prefix.as_str()) {
                break;
            }
            keys.push(k.to_string());
        }
        Ok(keys)
    }

    fn has_live_descendants(
        table: &mut EntryTable<'_>,
        batch: &mut Batch,
        key: &str,
    ) -> StoreResult<bool> {
        for child in Self::descendant_keys(table, key)? {
            if Self::load(table, batch, &child)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> StoreResult<StoreNode> {
        let key = normalize(key);
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;

        if let Some(guard) = table.get(key).map_err(map_err!(Backend))? {
            let entry = Entry::decode(key, guard.value())?;
            if !entry.is_expired(now) {
                return Ok(entry.into_node(key, now));
            }
        }

        // No value of its own: a directory if anything lives beneath it.
        let prefix = descendant_prefix(key);
        for item in table.range(prefix.as_str()..).map_err(map_err!(Backend))? {
            let (k, v) = item.map_err(map_err!(Backend))?;
            if !k.value().starts_with(prefix.as_str()) {
                break;
            }
            if !Entry::decode(k.value(), v.value())?.is_expired(now) {
                return Ok(build_tree(key, Vec::new()));
            }
        }
        Err(StoreError::KeyNotFound(key.to_string()))
    }

    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode> {
        let key = normalize(key);
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;

        let mut leaves = Vec::new();
        if let Some(guard) = table.get(key).map_err(map_err!(Backend))? {
            let entry = Entry::decode(key, guard.value())?;
            if !entry.is_expired(now) {
                leaves.push(entry.into_node(key, now));
            }
        }

        let prefix = descendant_prefix(key);
        for item in table.range(prefix.as_str()..).map_err(map_err!(Backend))? {
            let (k, v) = item.map_err(map_err!(Backend))?;
            let k = k.value();
            if !k.starts_with(prefix.as_str()) {
                break;
            }
            let entry = Entry::decode(k, v.value())?;
            if !entry.is_expired(now) {
                leaves.push(entry.into_node(k, now));
            }
        }

        Ok(build_tree(key, leaves))
    }

    fn create(&self, node: StoreNode) -> StoreResult<StoreNode> {
        self.write(|table, batch| {
            let key = normalize(&node.key).to_string();
            if Self::load(table, batch, &key)?.is_some() {
                return Err(StoreError::KeyExists(key));
            }
            Self::store(table, batch, node, None)
        })
    }

    fn set(&self, node: StoreNode) -> StoreResult<StoreNode> {
        self.write(|table, batch| {
            let prev = Self::load(table, batch, normalize(&node.key))?;
            Self::store(table, batch, node, prev)
        })
    }

    fn set_multi(&self, nodes: Vec<StoreNode>) -> StoreResult<()> {
        self.write(|table, batch| {
            for node in nodes {
                let prev = Self::load(table, batch, normalize(&node.key))?;
                Self::store(table, batch, node, prev)?;
            }
            Ok(())
        })
    }

    fn compare_and_swap(&self, prev: &StoreNode, node: StoreNode) -> StoreResult<StoreNode> {
        self.write(|table, batch| {
            let key = normalize(&prev.key).to_string();
            let current = Self::load(table, batch, &key)?
                .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
            if current.value != prev.value {
                return Err(StoreError::ValueMismatch(key));
            }
            Self::store(table, batch, node, Some(current))
        })
    }

    fn compare_and_swap_by_index(
        &self,
        prev_index: u64,
        node: StoreNode,
    ) -> StoreResult<StoreNode> {
        self.write(|table, batch| {
            let key = normalize(&node.key).to_string();
            let current = Self::load(table, batch, &key)?
                .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
            if current.index != prev_index {
                return Err(StoreError::IndexMismatch {
                    key,
                    expected: prev_index,
                    actual: current.index,
                });
            }
            Self::store(table, batch, node, Some(current))
        })
    }

    fn compare_and_delete(&self, prev: &StoreNode) -> StoreResult<()> {
        self.write(|table, batch| {
            let key = normalize(&prev.key).to_string();
            let current = Self::load(table, batch, &key)?
                .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
            if current.value != prev.value {
                return Err(StoreError::ValueMismatch(key));
            }
            Self::remove(table, batch, &key, current)
        })
    }

    fn compare_and_delete_by_index(&self, prev_index: u64, key: &str) -> StoreResult<()> {
        self.write(|table, batch| {
            let key = normalize(key).to_string();
            let current = Self::load(table, batch, &key)?
                .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
            if current.index != prev_index {
                return Err(StoreError::IndexMismatch {
                    key,
                    expected: prev_index,
                    actual: current.index,
                });
            }
            Self::remove(table, batch, &key, current)
        })
    }

    fn delete(&self, keys: &[&str]) -> StoreResult<()> {
        let missing = self.write(|table, batch| {
            let mut missing = None;
            for key in keys {
                let key = normalize(key);
                let mut found = false;
                if let Some(entry) = Self::load(table, batch, key)? {
                    Self::remove(table, batch, key, entry)?;
                    found = true;
                }
                for child in Self::descendant_keys(table, key)? {
                    if let Some(entry) = Self::load(table, batch, &child)? {
                        Self::remove(table, batch, &child, entry)?;
                        found = true;
                    }
                }
                if !found && missing.is_none() {
                    missing = Some(key.to_string());
                }
            }
            Ok(missing)
        })?;

        match missing {
            Some(key) => Err(StoreError::KeyNotFound(key)),
            None => Ok(()),
        }
    }

    fn delete_leaves(&self, keys: &[&str]) -> StoreResult<()> {
        self.write(|table, batch| {
            for key in keys {
                let key = normalize(key);
                if Self::has_live_descendants(table, batch, key)? {
                    continue;
                }
                if let Some(entry) = Self::load(table, batch, key)? {
                    Self::remove(table, batch, key, entry)?;
                }
            }
            Ok(())
        })
    }

    fn watch(&self, prefix: &str) -> StoreResult<Watch> {
        Ok(self.watches.subscribe(prefix))
    }

    fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Backend))?;
            let table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
            let mut keys = Vec::new();
            for item in table.iter().map_err(map_err!(Backend))? {
                let (k, v) = item.map_err(map_err!(Backend))?;
                if Entry::decode(k.value(), v.value())?.is_expired(now) {
                    keys.push(k.value().to_string());
                }
            }
            keys
        };
        if expired.is_empty() {
            return Ok(0);
        }

        // `load` removes and reports whatever is still expired at commit time.
        let purged = self.write(|table, batch| {
            let before = batch.changes.len();
            for key in &expired {
                Self::load(table, batch, key)?;
            }
            Ok(batch.changes.len() - before)
        })?;
        if purged > 0 {
            debug!(purged, "expired keys purged");
        }
        Ok(purged)
    }
}
