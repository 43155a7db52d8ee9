//! LRP convergence: desired instances against observed ones.
//!
//! Destructive steps (stopping and deleting instances nobody desires,
//! requesting stop auctions for excess instances) only run in domains
//! with a live freshness beacon. Without one, the desired set may simply
//! be incomplete. Starting missing instances is gated the same way.

use std::collections::{BTreeMap, HashMap, HashSet};

use bulletin_board::Stored;
use bulletin_board::actual::is_evacuating_key;
use bulletin_core::keys::{ACTUAL_LRP_SCHEMA_ROOT, DESIRED_LRP_SCHEMA_ROOT};
use bulletin_core::{
    ActualLrp, ActualLrpState, CellPresence, DesiredLrp, LrpStartAuction, LrpStopAuction,
};
use bulletin_store::KvStore;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Batch, Effect};
use crate::cell_client::CellClient;
use crate::error::ConvergeResult;
use crate::stats::ConvergeStats;
use crate::{Converger, encode};

impl<S: KvStore, C: CellClient> Converger<S, C> {
    /// One LRP pass over a snapshot of desired and actual LRPs, cells, and
    /// freshness.
    #[instrument(skip(self))]
    pub async fn converge_lrps(&self) -> ConvergeResult<ConvergeStats> {
        let desired = self.bbs.scan::<DesiredLrp>(DESIRED_LRP_SCHEMA_ROOT)?;
        let actual = self.bbs.scan::<ActualLrp>(ACTUAL_LRP_SCHEMA_ROOT)?;
        let cells = self.bbs.live_cells()?;
        let fresh: HashSet<String> = self
            .bbs
            .freshnesses()?
            .into_iter()
            .map(|f| f.domain)
            .collect();
        let now = self.now();

        let mut stats = ConvergeStats::default();
        let mut batch = Batch::default();
        let mut auctions: Vec<LrpStartAuction> = Vec::new();
        let mut stop_auctions: Vec<LrpStopAuction> = Vec::new();
        let mut orphans: Vec<Stored<ActualLrp>> = Vec::new();

        for node in desired.malformed.iter().chain(&actual.malformed) {
            batch.delete(node.index, node.key.as_str(), Effect::MalformedDeleted);
        }

        // process_guid → index → instance, ordered for stable output.
        let mut by_process: HashMap<String, BTreeMap<i32, Stored<ActualLrp>>> = HashMap::new();
        for stored in actual.records {
            if is_evacuating_key(&stored.key) {
                continue;
            }
            by_process
                .entry(stored.record.key.process_guid.clone())
                .or_default()
                .insert(stored.record.key.index, stored);
        }

        let desired_guids: HashSet<&str> = desired
            .records
            .iter()
            .map(|d| d.record.process_guid.as_str())
            .collect();

        for Stored { record: lrp, .. } in &desired.records {
            if !fresh.contains(&lrp.domain) {
                debug!(process_guid = %lrp.process_guid, domain = %lrp.domain, "domain not fresh, skipping");
                continue;
            }
            let instances = by_process.get(&lrp.process_guid);

            for index in 0..lrp.instances {
                let Ok(index) = i32::try_from(index) else {
                    break;
                };
                let auction = LrpStartAuction::new(lrp.clone(), index, now);
                match instances.and_then(|m| m.get(&index)) {
                    None => auctions.push(auction),
                    Some(stored) => match stored.record.state {
                        ActualLrpState::Unclaimed => auctions.push(auction),
                        ActualLrpState::Claimed | ActualLrpState::Running
                            if !cells.contains_key(&stored.record.container_key.cell_id) =>
                        {
                            let mut demoted = stored.record.clone();
                            demoted.demote_to_unclaimed(now);
                            if let Some(node) = encode(&stored.key, &demoted) {
                                batch.swap_then_auction(
                                    stored.index,
                                    node,
                                    Effect::LrpDemoted,
                                    auction,
                                );
                            }
                        }
                        _ => {}
                    },
                }
            }

            let excess = instances.is_some_and(|m| {
                m.keys()
                    .next_back()
                    .is_some_and(|&top| i64::from(top) >= i64::from(lrp.instances))
            });
            if excess {
                stop_auctions.push(LrpStopAuction::new(&lrp.process_guid, lrp.instances, now));
            }
        }

        for (process_guid, instances) in by_process {
            if desired_guids.contains(process_guid.as_str()) {
                continue;
            }
            for stored in instances.into_values() {
                if fresh.contains(&stored.record.key.domain) {
                    orphans.push(stored);
                } else {
                    debug!(%process_guid, domain = %stored.record.key.domain, "orphan in stale domain left alone");
                }
            }
        }

        for stored in orphans {
            self.reap_orphan(stored, &cells, &mut batch, &mut stats).await;
        }

        let follow_ups = batch.apply(self.bbs.store(), &mut stats).await;
        auctions.extend(follow_ups);
        for auction in &auctions {
            self.request_start_auction(auction, &mut stats).await;
        }
        for auction in &stop_auctions {
            match self.bbs.request_lrp_stop_auction(auction).await {
                Ok(true) => stats.stop_auctions_requested += 1,
                Ok(false) => {
                    debug!(process_guid = %auction.process_guid, "stop auction already pending");
                }
                Err(e) => {
                    warn!(process_guid = %auction.process_guid, error = %e, "failed to request stop auction");
                    stats.failures += 1;
                }
            }
        }

        if stats.writes() > 0 || stats.stop_requests_sent > 0 {
            info!(
                lrps_demoted = stats.lrps_demoted,
                start_auctions_requested = stats.start_auctions_requested,
                stop_auctions_requested = stats.stop_auctions_requested,
                stop_requests_sent = stats.stop_requests_sent,
                actuals_deleted = stats.actuals_deleted,
                malformed_deleted = stats.malformed_deleted,
                conflicts = stats.conflicts,
                "lrps converged"
            );
        }
        Ok(stats)
    }

    /// Stop an undesired instance on its cell, then delete its record.
    ///
    /// When the cell cannot be reached, or its presence cannot be read, the
    /// record is left for the next tick.
    async fn reap_orphan(
        &self,
        stored: Stored<ActualLrp>,
        cells: &HashMap<String, Option<CellPresence>>,
        batch: &mut Batch,
        stats: &mut ConvergeStats,
    ) {
        let lrp = &stored.record;
        if lrp.state != ActualLrpState::Unclaimed {
            match cells.get(&lrp.container_key.cell_id) {
                Some(Some(cell)) => match self
                    .cell_client
                    .stop_lrp_instance(&cell.rep_address, &lrp.stop_request())
                    .await
                {
                    Ok(()) => stats.stop_requests_sent += 1,
                    Err(e) => {
                        warn!(
                            process_guid = %lrp.key.process_guid,
                            index = lrp.key.index,
                            cell_id = %lrp.container_key.cell_id,
                            error = %e,
                            retryable = e.is_retryable(),
                            "failed to stop undesired instance"
                        );
                        stats.failures += 1;
                        return;
                    }
                },
                Some(None) => {
                    warn!(
                        process_guid = %lrp.key.process_guid,
                        index = lrp.key.index,
                        cell_id = %lrp.container_key.cell_id,
                        "cell presence unreadable, keeping undesired instance"
                    );
                    stats.failures += 1;
                    return;
                }
                None => {}
            }
        }
        batch.delete(stored.index, stored.key, Effect::ActualDeleted);
    }

    async fn request_start_auction(&self, auction: &LrpStartAuction, stats: &mut ConvergeStats) {
        match self.bbs.request_lrp_start_auction(auction).await {
            Ok(()) => stats.start_auctions_requested += 1,
            Err(bulletin_board::BbsError::AlreadyExists { .. }) => {
                debug!(process_guid = %auction.process_guid(), index = auction.index, "start auction already pending");
            }
            Err(e) => {
                warn!(process_guid = %auction.process_guid(), index = auction.index, error = %e, "failed to request start auction");
                stats.failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bulletin_core::{
        ActualLrpContainerKey, ActualLrpKey, CellPresence, Freshness, Record,
    };
    use bulletin_store::{KvStore, StoreNode};

    use crate::testing::{RecordingCells, T0, converger, converger_with};

    use super::*;

    fn put<R: Record>(store: &impl KvStore, record: &R) {
        store
            .set(StoreNode::new(record.key(), record.to_json().unwrap()))
            .unwrap();
    }

    fn fresh(domain: &str) -> Freshness {
        Freshness {
            domain: domain.to_string(),
            ttl_in_seconds: 0,
        }
    }

    fn running(process_guid: &str, index: i32, cell: &str) -> ActualLrp {
        let mut lrp = ActualLrp::unclaimed(ActualLrpKey::new(process_guid, index, "d1"), T0);
        lrp.state = ActualLrpState::Running;
        lrp.container_key = ActualLrpContainerKey::new(&format!("ig-{index}"), cell);
        lrp
    }

    #[tokio::test]
    async fn missing_instances_get_start_auctions() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &DesiredLrp::new("p1", "d1", "s", 2));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.start_auctions_requested, 2);

        let mut indices: Vec<i32> = c
            .bbs()
            .lrp_start_auctions()
            .unwrap()
            .into_iter()
            .map(|a| a.index)
            .collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn pending_start_auction_is_not_duplicated() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &DesiredLrp::new("p1", "d1", "s", 1));

        c.converge_lrps().await.unwrap();
        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.start_auctions_requested, 0);
        assert_eq!(stats.failures, 0);
        assert_eq!(c.bbs().lrp_start_auctions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_domain_is_skipped() {
        let (c, _) = converger();
        put(c.bbs().store(), &DesiredLrp::new("p1", "d1", "s", 2));
        put(c.bbs().store(), &running("p2", 0, "cellA"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.writes(), 0);
        assert!(c.bbs().lrp_start_auctions().unwrap().is_empty());
        assert_eq!(c.bbs().actual_lrps().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn instance_on_vanished_cell_is_demoted_and_reauctioned() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &DesiredLrp::new("p1", "d1", "s", 1));
        put(c.bbs().store(), &running("p1", 0, "gone"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.lrps_demoted, 1);
        assert_eq!(stats.start_auctions_requested, 1);

        let actual = c.bbs().actual_lrps().unwrap();
        assert_eq!(actual.len(), 1);
        assert_eq!(actual[0].state, ActualLrpState::Unclaimed);
        assert!(actual[0].container_key.is_empty());
        assert_eq!(c.bbs().lrp_start_auctions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undesired_instance_is_stopped_then_deleted() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &CellPresence::new("cellA", "s", "10.0.0.1:1800"));
        put(c.bbs().store(), &running("p1", 0, "cellA"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.stop_requests_sent, 1);
        assert_eq!(stats.actuals_deleted, 1);
        assert!(c.bbs().actual_lrps().unwrap().is_empty());

        let stops = c.cell_client.stops.lock().unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].0, "10.0.0.1:1800");
        assert_eq!(stops[0].1.instance_guid, "ig-0");
    }

    #[tokio::test]
    async fn undesired_instance_survives_unreachable_cell() {
        let (c, _) = converger_with(RecordingCells {
            refuse: true,
            ..Default::default()
        });
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &CellPresence::new("cellA", "s", "10.0.0.1:1800"));
        put(c.bbs().store(), &running("p1", 0, "cellA"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.actuals_deleted, 0);
        assert_eq!(c.bbs().actual_lrps().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undesired_instance_on_vanished_cell_is_just_deleted() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &running("p1", 0, "gone"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.stop_requests_sent, 0);
        assert_eq!(stats.actuals_deleted, 1);
        assert!(c.bbs().actual_lrps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn excess_instances_get_a_stop_auction() {
        let (c, _) = converger();
        put(c.bbs().store(), &fresh("d1"));
        put(c.bbs().store(), &CellPresence::new("cellA", "s", "10.0.0.1:1800"));
        put(c.bbs().store(), &DesiredLrp::new("p1", "d1", "s", 1));
        put(c.bbs().store(), &running("p1", 0, "cellA"));
        put(c.bbs().store(), &running("p1", 1, "cellA"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.stop_auctions_requested, 1);
        assert_eq!(stats.start_auctions_requested, 0);

        let auctions = c.bbs().lrp_stop_auctions().unwrap();
        assert_eq!(auctions.len(), 1);
        assert_eq!(auctions[0].process_guid, "p1");
        assert_eq!(auctions[0].instances, 1);
        assert_eq!(c.bbs().actual_lrps().unwrap().len(), 2);

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.stop_auctions_requested, 0);
        assert_eq!(stats.writes(), 0);
        assert_eq!(c.bbs().lrp_stop_auctions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn instances_on_undecodable_cell_are_left_alone() {
        let (c, _) = converger();
        let store = c.bbs().store();
        store
            .set(StoreNode::new("/v1/cell/cellA", b"not json".to_vec()))
            .unwrap();
        put(store, &fresh("d1"));
        put(store, &DesiredLrp::new("p1", "d1", "s", 1));
        put(store, &running("p1", 0, "cellA"));
        put(store, &running("p2", 0, "cellA"));

        let stats = c.converge_lrps().await.unwrap();
        assert_eq!(stats.lrps_demoted, 0);
        assert_eq!(stats.start_auctions_requested, 0);
        assert_eq!(stats.actuals_deleted, 0);
        assert_eq!(stats.failures, 1);
        assert!(c.cell_client.stops.lock().unwrap().is_empty());

        let actual = c.bbs().actual_lrps().unwrap();
        assert_eq!(actual.len(), 2);
        assert!(actual.iter().all(|lrp| lrp.state == ActualLrpState::Running));
    }
}
