//! Concurrent conditional writes with a join barrier.
//!
//! A pass collects its decisions into a [`Batch`] and applies them all at
//! once. Every write is index-conditional, so the order they land in does
//! not matter, and [`Batch::apply`] returns only after every write has
//! settled.

use bulletin_core::LrpStartAuction;
use bulletin_store::{KvStore, StoreError, StoreNode, StoreResult};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::stats::ConvergeStats;

/// The counter a write bumps once it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    TaskFailed,
    TaskKicked,
    TaskDemoted,
    TaskExpired,
    LrpDemoted,
    ActualDeleted,
    AuctionKicked,
    AuctionExpired,
    EvacuatingRemoved,
    MalformedDeleted,
}

impl Effect {
    fn count(self, stats: &mut ConvergeStats) {
        let counter = match self {
            Effect::TaskFailed => &mut stats.tasks_failed,
            Effect::TaskKicked => &mut stats.tasks_kicked,
            Effect::TaskDemoted => &mut stats.tasks_demoted,
            Effect::TaskExpired => &mut stats.tasks_expired,
            Effect::LrpDemoted => &mut stats.lrps_demoted,
            Effect::ActualDeleted => &mut stats.actuals_deleted,
            Effect::AuctionKicked => &mut stats.auctions_kicked,
            Effect::AuctionExpired => &mut stats.auctions_expired,
            Effect::EvacuatingRemoved => &mut stats.evacuating_removed,
            Effect::MalformedDeleted => &mut stats.malformed_deleted,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone)]
enum Op {
    Swap { index: u64, node: StoreNode },
    Delete { index: u64, key: String },
}

impl Op {
    fn key(&self) -> &str {
        match self {
            Op::Swap { node, .. } => &node.key,
            Op::Delete { key, .. } => key,
        }
    }

    fn run<S: KvStore>(&self, store: &S) -> StoreResult<()> {
        match self {
            Op::Swap { index, node } => store
                .compare_and_swap_by_index(*index, node.clone())
                .map(|_| ()),
            Op::Delete { index, key } => store.compare_and_delete_by_index(*index, key),
        }
    }
}

#[derive(Debug, Clone)]
struct Write {
    op: Op,
    effect: Effect,
    then: Option<LrpStartAuction>,
}

/// Auctions to request for writes that landed.
pub(crate) type FollowUps = Vec<LrpStartAuction>;

#[derive(Debug, Default)]
pub(crate) struct Batch {
    writes: Vec<Write>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Replace `node.key` if it is still at `index`.
    pub fn swap(&mut self, index: u64, node: StoreNode, effect: Effect) {
        self.writes.push(Write {
            op: Op::Swap { index, node },
            effect,
            then: None,
        });
    }

    /// Like [`Batch::swap`], requesting `auction` once the write lands.
    pub fn swap_then_auction(
        &mut self,
        index: u64,
        node: StoreNode,
        effect: Effect,
        auction: LrpStartAuction,
    ) {
        self.writes.push(Write {
            op: Op::Swap { index, node },
            effect,
            then: Some(auction),
        });
    }

    /// Delete `key` if it is still at `index`.
    pub fn delete(&mut self, index: u64, key: impl Into<String>, effect: Effect) {
        self.writes.push(Write {
            op: Op::Delete {
                index,
                key: key.into(),
            },
            effect,
            then: None,
        });
    }

    /// Run every write on the blocking pool and wait for all of them.
    pub async fn apply<S: KvStore>(self, store: &S, stats: &mut ConvergeStats) -> FollowUps {
        let mut follow_ups = Vec::new();
        if self.writes.is_empty() {
            return follow_ups;
        }

        let mut set = JoinSet::new();
        for write in self.writes {
            let store = store.clone();
            set.spawn_blocking(move || {
                let result = write.op.run(&store);
                (write, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (write, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "convergence write task failed");
                    stats.failures += 1;
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    write.effect.count(stats);
                    follow_ups.extend(write.then);
                }
                Err(StoreError::KeyNotFound(_)) | Err(StoreError::IndexMismatch { .. }) => {
                    debug!(key = %write.op.key(), "record changed during pass, skipping");
                    stats.conflicts += 1;
                }
                Err(e) => {
                    warn!(key = %write.op.key(), error = %e, "convergence write failed");
                    stats.failures += 1;
                }
            }
        }
        follow_ups
    }
}

#[cfg(test)]
mod tests {
    use bulletin_store::RedbStore;

    use super::*;

    #[tokio::test]
    async fn applies_all_and_counts_conflicts() {
        let store = RedbStore::open_in_memory().unwrap();
        let a = store.create(StoreNode::new("/v1/task/a", b"1".to_vec())).unwrap();
        let b = store.create(StoreNode::new("/v1/task/b", b"1".to_vec())).unwrap();
        let stale = a.index;
        store.set(StoreNode::new("/v1/task/a", b"2".to_vec())).unwrap();

        let mut batch = Batch::default();
        batch.swap(stale, StoreNode::new("/v1/task/a", b"3".to_vec()), Effect::TaskKicked);
        batch.delete(b.index, "/v1/task/b", Effect::TaskExpired);

        let mut stats = ConvergeStats::default();
        let follow_ups = batch.apply(&store, &mut stats).await;

        assert!(follow_ups.is_empty());
        assert_eq!(stats.tasks_expired, 1);
        assert_eq!(stats.tasks_kicked, 0);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(store.get("/v1/task/a").unwrap().value, b"2");
        assert!(store.get("/v1/task/b").is_err());
    }
}
