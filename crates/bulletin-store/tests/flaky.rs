//! Retrying writes through a store that times out intermittently.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bulletin_store::watch::Watch;
use bulletin_store::{
    KvStore, RedbStore, RetryPolicy, StoreError, StoreNode, StoreResult, retry_indefinitely,
};

/// Fails the next `failures` writes with `Timeout`, then delegates.
#[derive(Clone)]
struct FlakyStore {
    inner: RedbStore,
    failures: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: RedbStore::open_in_memory().unwrap(),
            failures: Arc::new(AtomicUsize::new(failures)),
        }
    }

    fn trip(&self) -> StoreResult<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Timeout);
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> StoreResult<StoreNode> {
        self.inner.get(key)
    }
    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode> {
        self.inner.list_recursively(key)
    }
    fn create(&self, node: StoreNode) -> StoreResult<StoreNode> {
        self.trip()?;
        self.inner.create(node)
    }
    fn set(&self, node: StoreNode) -> StoreResult<StoreNode> {
        self.trip()?;
        self.inner.set(node)
    }
    fn set_multi(&self, nodes: Vec<StoreNode>) -> StoreResult<()> {
        self.trip()?;
        self.inner.set_multi(nodes)
    }
    fn compare_and_swap(&self, prev: &StoreNode, node: StoreNode) -> StoreResult<StoreNode> {
        self.trip()?;
        self.inner.compare_and_swap(prev, node)
    }
    fn compare_and_swap_by_index(&self, prev_index: u64, node: StoreNode) -> StoreResult<StoreNode> {
        self.trip()?;
        self.inner.compare_and_swap_by_index(prev_index, node)
    }
    fn compare_and_delete(&self, prev: &StoreNode) -> StoreResult<()> {
        self.trip()?;
        self.inner.compare_and_delete(prev)
    }
    fn compare_and_delete_by_index(&self, prev_index: u64, key: &str) -> StoreResult<()> {
        self.trip()?;
        self.inner.compare_and_delete_by_index(prev_index, key)
    }
    fn delete(&self, keys: &[&str]) -> StoreResult<()> {
        self.trip()?;
        self.inner.delete(keys)
    }
    fn delete_leaves(&self, keys: &[&str]) -> StoreResult<()> {
        self.trip()?;
        self.inner.delete_leaves(keys)
    }
    fn watch(&self, prefix: &str) -> StoreResult<Watch> {
        self.inner.watch(prefix)
    }
    fn purge_expired(&self) -> StoreResult<usize> {
        self.inner.purge_expired()
    }
}

#[tokio::test(start_paused = true)]
async fn create_survives_timeouts() {
    let store = FlakyStore::new(3);
    let policy = RetryPolicy::new(Duration::from_millis(100));

    let node = retry_indefinitely(policy, "create", || {
        store.create(StoreNode::new("/v1/task/t1", b"{}".to_vec()))
    })
    .await
    .unwrap();

    assert_eq!(store.get("/v1/task/t1").unwrap().index, node.index);
    assert_eq!(store.failures.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cas_conflict_is_not_retried() {
    let store = FlakyStore::new(0);
    let policy = RetryPolicy::new(Duration::from_millis(100));
    let first = store.create(StoreNode::new("/k", b"a".to_vec())).unwrap();
    store.set(StoreNode::new("/k", b"b".to_vec())).unwrap();

    // One timeout, then a genuine index mismatch that must surface.
    store.failures.store(1, Ordering::SeqCst);
    let err = retry_indefinitely(policy, "cas", || {
        store.compare_and_swap_by_index(first.index, StoreNode::new("/k", b"c".to_vec()))
    })
    .await
    .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.get("/k").unwrap().value, b"b");
}
