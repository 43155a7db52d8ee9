//! bulletin-converger: periodic reconciliation of the bulletin board.
//!
//! Each tick takes a snapshot of the board and repairs whatever drifted:
//! tasks nobody claimed, instances on cells that vanished, auctions that
//! stalled, instances nobody desires. Every write is conditional on the
//! index the snapshot saw, so a record another actor touched mid-pass is
//! skipped rather than clobbered.
//!
//! # Passes
//!
//! - **tasks**: fail, republish, demote, or expire tasks
//! - **lrps**: start missing instances, stop undesired and excess ones
//! - **auctions**: republish or expire start and stop auctions
//! - **evacuating**: drop evacuating records that are no longer needed
//!
//! Only the holder of the converge lock should call [`Converger::run`].

use std::sync::Arc;
use std::time::Duration;

use bulletin_board::Bbs;
use bulletin_core::clock::duration_nanos;
use bulletin_core::config::ConvergenceConfig;
use bulletin_core::keys::CELL_SCHEMA_ROOT;
use bulletin_core::Record;
use bulletin_store::{KvStore, StoreNode, Watch, WatchEvent};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod auctions;
mod batch;
pub mod cell_client;
pub mod error;
mod evacuating;
mod lrps;
pub mod stats;
pub mod tasks;

pub use cell_client::{CellClient, HttpCellClient};
pub use error::{CellClientError, ConvergeError, ConvergeResult};
pub use stats::ConvergeStats;

/// Reconciles the board against its own invariants.
pub struct Converger<S, C> {
    bbs: Bbs<S>,
    cell_client: Arc<C>,
    config: ConvergenceConfig,
}

impl<S: KvStore, C: CellClient> Converger<S, C> {
    pub fn new(bbs: Bbs<S>, cell_client: Arc<C>, config: ConvergenceConfig) -> Self {
        Self {
            bbs,
            cell_client,
            config,
        }
    }

    pub fn bbs(&self) -> &Bbs<S> {
        &self.bbs
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        self.bbs.clock().now()
    }

    /// Run every pass once.
    ///
    /// Per-record failures are counted and retried next tick. A pass that
    /// cannot read its snapshot aborts the rest of the tick.
    pub async fn converge(&self) -> ConvergeResult<ConvergeStats> {
        let mut total = self.converge_tasks().await?;
        total += self.converge_lrps().await?;
        total += self.converge_start_auctions().await?;
        total += self.converge_stop_auctions().await?;
        total += self.converge_evacuating().await?;
        debug!(
            writes = total.writes(),
            conflicts = total.conflicts,
            failures = total.failures,
            "convergence tick finished"
        );
        Ok(total)
    }

    /// Converge every `config.interval` until `shutdown` flips.
    ///
    /// A cell disappearing triggers an immediate task and LRP pass instead
    /// of waiting for the next tick. A pass in progress is abandoned at its
    /// next await point once `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval;
        info!(interval_ms = interval.as_millis() as u64, "converger started");

        let mut cells = self.watch_cells();
        loop {
            let pass = tokio::select! {
                _ = tokio::time::sleep(interval) => Pass::Tick,
                event = next_event(&mut cells) => match event {
                    Some(WatchEvent::Delete(node)) => {
                        info!(key = %node.key, "cell disappeared, converging");
                        Pass::CellLoss
                    }
                    Some(_) => continue,
                    None => {
                        warn!("cell watch closed, resubscribing on next tick");
                        cells = None;
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    info!("converger shutting down");
                    break;
                }
            };

            tokio::select! {
                result = self.converge_pass(pass) => {
                    if let Err(e) = result {
                        error!(error = %e, ?pass, "convergence pass aborted");
                    }
                }
                _ = shutdown.changed() => {
                    info!(?pass, "converger shutting down, pass abandoned");
                    break;
                }
            }

            if pass == Pass::Tick && cells.is_none() {
                cells = self.watch_cells();
            }
        }
        if let Some(watch) = cells {
            watch.cancel.cancel();
        }
    }

    async fn converge_pass(&self, pass: Pass) -> ConvergeResult<ConvergeStats> {
        match pass {
            Pass::Tick => self.converge().await,
            Pass::CellLoss => self.converge_after_cell_loss().await,
        }
    }

    async fn converge_after_cell_loss(&self) -> ConvergeResult<ConvergeStats> {
        let mut stats = self.converge_tasks().await?;
        stats += self.converge_lrps().await?;
        Ok(stats)
    }

    fn watch_cells(&self) -> Option<Watch> {
        match self.bbs.store().watch(CELL_SCHEMA_ROOT) {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!(error = %e, "failed to watch cells");
                None
            }
        }
    }
}

/// What woke the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Tick,
    CellLoss,
}

async fn next_event(watch: &mut Option<Watch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Whether more than `d` has passed between `then` and `now`.
pub(crate) fn older_than(now: i64, then: i64, d: Duration) -> bool {
    now.saturating_sub(then) > duration_nanos(d)
}

/// Serialize `record` for a write at `key`; `None` (logged) when the
/// record cannot be encoded.
pub(crate) fn encode<R: Record>(key: &str, record: &R) -> Option<StoreNode> {
    match record.to_json() {
        Ok(value) => Some(StoreNode::new(key, value)),
        Err(e) => {
            warn!(%key, error = %e, "failed to encode record");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bulletin_core::{
        ActualLrp, ActualLrpContainerKey, ActualLrpKey, ActualLrpState, CellPresence, FakeClock,
        Freshness, StopLrpInstance,
    };
    use bulletin_store::RedbStore;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::CellClientResult;
    use crate::testing::T0;

    /// Never answers a stop request.
    #[derive(Debug, Default)]
    struct StuckCells {
        entered: Notify,
    }

    #[async_trait]
    impl CellClient for StuckCells {
        async fn stop_lrp_instance(
            &self,
            _rep_address: &str,
            _stop: &StopLrpInstance,
        ) -> CellClientResult<()> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    fn put<R: Record>(store: &impl KvStore, record: &R) {
        store
            .set(StoreNode::new(record.key(), record.to_json().unwrap()))
            .unwrap();
    }

    #[test]
    fn older_than_is_strict() {
        let d = Duration::from_secs(30);
        let then = 1_000;
        assert!(!older_than(then + duration_nanos(d), then, d));
        assert!(older_than(then + duration_nanos(d) + 1, then, d));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_a_pass_in_progress() {
        let clock = FakeClock::new(T0);
        let store = RedbStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let bbs = Bbs::new(store).with_clock(Arc::new(clock.clone()));
        put(bbs.store(), &Freshness {
            domain: "d1".to_string(),
            ttl_in_seconds: 0,
        });
        put(bbs.store(), &CellPresence::new("cellA", "s", "10.0.0.1:1800"));
        let mut orphan = ActualLrp::unclaimed(ActualLrpKey::new("p1", 0, "d1"), T0);
        orphan.state = ActualLrpState::Running;
        orphan.container_key = ActualLrpContainerKey::new("ig-0", "cellA");
        put(bbs.store(), &orphan);

        let cells = Arc::new(StuckCells::default());
        let converger = Converger::new(bbs.clone(), cells.clone(), ConvergenceConfig::default());
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(converger.run(rx));

        cells.entered.notified().await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bbs.actual_lrps().unwrap(), vec![orphan]);
    }
}
