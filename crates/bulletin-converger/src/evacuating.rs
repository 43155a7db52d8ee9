//! Evacuating record cleanup.
//!
//! An evacuating record keeps routes pointed at an instance on a draining
//! cell until its replacement is up. It is dropped once the slot is
//! running elsewhere, or once the draining cell itself is gone. Records
//! that outlive both conditions still expire with their TTL.

use std::collections::HashMap;

use bulletin_board::actual::is_evacuating_key;
use bulletin_core::keys::ACTUAL_LRP_SCHEMA_ROOT;
use bulletin_core::{ActualLrp, ActualLrpContainerKey, ActualLrpState};
use bulletin_store::KvStore;
use tracing::{debug, info, instrument};

use crate::batch::{Batch, Effect};
use crate::cell_client::CellClient;
use crate::error::ConvergeResult;
use crate::stats::ConvergeStats;
use crate::Converger;

impl<S: KvStore, C: CellClient> Converger<S, C> {
    #[instrument(skip(self))]
    pub async fn converge_evacuating(&self) -> ConvergeResult<ConvergeStats> {
        let scan = self.bbs.scan::<ActualLrp>(ACTUAL_LRP_SCHEMA_ROOT)?;
        let cells = self.bbs.live_cells()?;

        let (evacuating, slots): (Vec<_>, Vec<_>) = scan
            .records
            .into_iter()
            .partition(|stored| is_evacuating_key(&stored.key));
        // (process_guid, index) → container key of the running instance.
        let running: HashMap<(String, i32), ActualLrpContainerKey> = slots
            .into_iter()
            .filter(|stored| stored.record.state == ActualLrpState::Running)
            .map(|stored| {
                let lrp = stored.record;
                ((lrp.key.process_guid, lrp.key.index), lrp.container_key)
            })
            .collect();

        let mut batch = Batch::default();
        for stored in evacuating {
            let lrp = &stored.record;
            let slot = (lrp.key.process_guid.clone(), lrp.key.index);
            let replaced = running
                .get(&slot)
                .is_some_and(|ck| *ck != lrp.container_key);
            let cell_gone = !cells.contains_key(&lrp.container_key.cell_id);
            if replaced || cell_gone {
                debug!(
                    key = %stored.key,
                    replaced,
                    cell_gone,
                    "removing evacuating record"
                );
                batch.delete(stored.index, stored.key, Effect::EvacuatingRemoved);
            }
        }

        let mut stats = ConvergeStats::default();
        batch.apply(self.bbs.store(), &mut stats).await;
        if stats.writes() > 0 {
            info!(
                removed = stats.evacuating_removed,
                conflicts = stats.conflicts,
                "evacuating records converged"
            );
        }
        Ok(stats)
    }
}
