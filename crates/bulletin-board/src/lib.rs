//! bulletin-board: the state machines every participant writes through.
//!
//! [`Bbs`] wraps a [`KvStore`] with the legal transitions for tasks,
//! actual LRPs (including evacuation), desired LRPs, freshness beacons, and
//! auctions. Every update reads the current record, checks the transition,
//! and writes back with `compare_and_swap_by_index`, so a concurrent writer
//! turns into a conflict error instead of a lost update.
//!
//! # Components
//!
//! - **`task`**: desire / claim / start / cancel / fail / complete / resolve
//! - **`actual`**: claim / start / crash / remove / fail for instances
//! - **`evacuation`**: graceful handoff of instances off a draining cell
//! - **`desired`**: desired LRP lifecycle and freshness
//! - **`auction`**: start and stop auction request / claim / resolve
//! - **`presence`**: cell and auctioneer lookups, lease constructors
//! - **`watch`**: decoded change streams

use std::sync::Arc;

use bulletin_core::{Clock, Record, SystemClock};
use bulletin_store::{
    KvStore, RetryPolicy, StoreError, StoreNode, StoreResult, retry_indefinitely,
};
use tracing::warn;

pub mod actual;
pub mod auction;
pub mod desired;
pub mod error;
pub mod evacuation;
pub mod presence;
pub mod task;
pub mod watch;

pub use error::{BbsError, BbsResult};
pub use evacuation::ContainerRetention;
pub use watch::{ActualLrpChange, RecordChange, RecordWatch};

/// A decoded record together with where and when it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored<R> {
    pub key: String,
    pub index: u64,
    pub record: R,
}

/// Every record under a root, plus the nodes that failed to decode.
#[derive(Debug, Clone)]
pub struct Scan<R> {
    pub records: Vec<Stored<R>>,
    pub malformed: Vec<StoreNode>,
}

impl<R> Default for Scan<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

/// The bulletin board: state machines over a KV store.
#[derive(Clone)]
pub struct Bbs<S> {
    store: S,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: KvStore> Bbs<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    /// Use a different time source for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the pause between retries of writes that hit a transient error.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now()
    }

    // ── Read helpers ──────────────────────────────────────────────

    /// Decode every record beneath `root`.
    pub fn scan<R: Record>(&self, root: &str) -> BbsResult<Scan<R>> {
        let tree = self.store.list_recursively(root)?;
        let mut scan = Scan::default();
        for node in tree.values() {
            match R::from_json(&node.value) {
                Ok(record) => scan.records.push(Stored {
                    key: node.key.clone(),
                    index: node.index,
                    record,
                }),
                Err(e) => {
                    warn!(key = %node.key, error = %e, "malformed record");
                    let mut bad = node.clone();
                    bad.nodes.clear();
                    scan.malformed.push(bad);
                }
            }
        }
        Ok(scan)
    }

    /// Decoded records beneath `root`, skipping malformed ones.
    pub(crate) fn list<R: Record>(&self, root: &str) -> BbsResult<Vec<R>> {
        Ok(self
            .scan(root)?
            .records
            .into_iter()
            .map(|stored| stored.record)
            .collect())
    }

    /// The record at `key` and its modification index.
    pub(crate) fn fetch<R: Record>(&self, key: &str) -> BbsResult<Stored<R>> {
        let node = self.store.get(key)?;
        if node.dir {
            return Err(StoreError::KeyNotFound(key.to_string()).into());
        }
        Ok(Stored {
            key: node.key,
            index: node.index,
            record: R::from_json(&node.value)?,
        })
    }

    /// Like [`Bbs::fetch`], with a missing key as `None`.
    pub(crate) fn fetch_optional<R: Record>(&self, key: &str) -> BbsResult<Option<Stored<R>>> {
        match self.fetch(key) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Write helpers ─────────────────────────────────────────────

    /// Run a store write, retrying transient failures.
    pub(crate) async fn write<T>(
        &self,
        what: &str,
        op: impl FnMut() -> StoreResult<T>,
    ) -> BbsResult<T> {
        Ok(retry_indefinitely(self.retry, what, op).await?)
    }

    pub(crate) async fn create_record<R: Record>(
        &self,
        what: &str,
        record: &R,
    ) -> BbsResult<StoreNode> {
        self.create_at(what, &record.key(), record).await
    }

    /// Create `record` at an explicit key.
    pub(crate) async fn create_at<R: Record>(
        &self,
        what: &str,
        key: &str,
        record: &R,
    ) -> BbsResult<StoreNode> {
        let node = StoreNode::new(key, record.to_json()?);
        self.write(what, || self.store.create(node.clone())).await
    }

    /// Replace the record at its key if it was last written at `index`.
    pub(crate) async fn swap_record<R: Record>(
        &self,
        what: &str,
        index: u64,
        record: &R,
    ) -> BbsResult<StoreNode> {
        self.swap_at(what, index, &record.key(), record).await
    }

    pub(crate) async fn swap_at<R: Record>(
        &self,
        what: &str,
        index: u64,
        key: &str,
        record: &R,
    ) -> BbsResult<StoreNode> {
        let node = StoreNode::new(key, record.to_json()?);
        self.write(what, || {
            self.store.compare_and_swap_by_index(index, node.clone())
        })
        .await
    }

    /// Delete the value at `key` if it was last written at `index`.
    pub(crate) async fn delete_at(&self, what: &str, index: u64, key: &str) -> BbsResult<()> {
        self.write(what, || self.store.compare_and_delete_by_index(index, key))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use bulletin_core::FakeClock;
    use bulletin_store::RedbStore;

    use super::Bbs;

    /// 2025-01-01T00:00:00Z in Unix nanoseconds.
    pub const T0: i64 = 1_735_689_600_000_000_000;

    pub fn bbs() -> (Bbs<RedbStore>, FakeClock) {
        let clock = FakeClock::new(T0);
        let store = RedbStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let bbs = Bbs::new(store).with_clock(Arc::new(clock.clone()));
        (bbs, clock)
    }
}

#[cfg(test)]
mod tests {
    use bulletin_core::{Record, Task, action::Action};
    use bulletin_store::{KvStore, StoreNode};

    use super::testing::bbs;

    #[test]
    fn scan_separates_malformed() {
        let (bbs, _) = bbs();
        let task = Task::new("t1", "d", "s", vec![Action::run("ls", &[])]);
        bbs.store()
            .set(StoreNode::new(task.key(), task.to_json().unwrap()))
            .unwrap();
        bbs.store()
            .set(StoreNode::new("/v1/task/bad", b"{oops".to_vec()))
            .unwrap();

        let scan = bbs.scan::<Task>("/v1/task").unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].record, task);
        assert_eq!(scan.malformed.len(), 1);
        assert_eq!(scan.malformed[0].key, "/v1/task/bad");
    }

    #[test]
    fn fetch_of_directory_is_not_found() {
        let (bbs, _) = bbs();
        bbs.store()
            .set(StoreNode::new("/v1/task/t1/child", b"{}".to_vec()))
            .unwrap();
        let err = bbs.fetch::<Task>("/v1/task/t1").unwrap_err();
        assert!(err.is_not_found());
    }
}
