//! Start and stop auction requests.
//!
//! Auctions are request records for the auctioneer: `request` publishes
//! one as Pending, the auctioneer `claim`s it while deciding placement, and
//! `resolve` deletes it once the decision is carried out.

use bulletin_core::keys::{self, START_AUCTION_SCHEMA_ROOT, STOP_AUCTION_SCHEMA_ROOT};
use bulletin_core::{ActualLrp, AuctionState, LrpStartAuction, LrpStopAuction, Record};
use bulletin_store::{KvStore, StoreError};
use tracing::{debug, info, instrument, warn};

use crate::actual::is_evacuating_key;
use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

const START_RECORD: &str = "start auction";
const STOP_RECORD: &str = "stop auction";

impl<S: KvStore> Bbs<S> {
    // ── Start auctions ────────────────────────────────────────────

    pub fn lrp_start_auctions(&self) -> BbsResult<Vec<LrpStartAuction>> {
        self.list(START_AUCTION_SCHEMA_ROOT)
    }

    /// Ask the auctioneer to place one instance.
    #[instrument(skip(self, auction), fields(process_guid = %auction.process_guid(), index = auction.index))]
    pub async fn request_lrp_start_auction(&self, auction: &LrpStartAuction) -> BbsResult<()> {
        let mut auction = auction.clone();
        auction.state = AuctionState::Pending;
        auction.updated_at = self.now();
        auction.validate()?;

        match self.create_record("request start auction", &auction).await {
            Ok(_) => {
                info!("start auction requested");
                Ok(())
            }
            Err(BbsError::Store(StoreError::KeyExists(key))) => Err(BbsError::AlreadyExists {
                record: START_RECORD,
                key,
            }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn claim_lrp_start_auction(&self, process_guid: &str, index: i32) -> BbsResult<()> {
        let Stored { key, index: at, record } =
            self.fetch::<LrpStartAuction>(&keys::start_auction_key(process_guid, index))?;
        if record.state != AuctionState::Pending {
            return Err(BbsError::transition(
                START_RECORD,
                &key,
                record.state,
                AuctionState::Claimed,
            ));
        }

        let mut auction = record;
        auction.state = AuctionState::Claimed;
        auction.updated_at = self.now();
        self.swap_record("claim start auction", at, &auction).await?;
        debug!("start auction claimed");
        Ok(())
    }

    /// Delete a claimed start auction. Directories are implicit, so the
    /// process directory disappears with its last auction.
    #[instrument(skip(self))]
    pub async fn resolve_lrp_start_auction(&self, process_guid: &str, index: i32) -> BbsResult<()> {
        let Stored { key, index: at, record } =
            self.fetch::<LrpStartAuction>(&keys::start_auction_key(process_guid, index))?;
        if record.state != AuctionState::Claimed {
            return Err(BbsError::TransitionNotAllowed {
                record: START_RECORD,
                key,
                from: record.state.to_string(),
                to: "Deleted".to_string(),
            });
        }

        self.delete_at("resolve start auction", at, &key).await?;
        info!("start auction resolved");
        Ok(())
    }

    // ── Stop auctions ─────────────────────────────────────────────

    pub fn lrp_stop_auctions(&self) -> BbsResult<Vec<LrpStopAuction>> {
        self.list(STOP_AUCTION_SCHEMA_ROOT)
    }

    /// Ask the auctioneer to stop the instances beyond `auction.instances`.
    ///
    /// There is one stop auction per process: a request for a process that
    /// already has a pending one updates its instance count. Returns whether
    /// anything was written; `false` when an existing auction already covers
    /// the request.
    #[instrument(skip(self, auction), fields(process_guid = %auction.process_guid))]
    pub async fn request_lrp_stop_auction(&self, auction: &LrpStopAuction) -> BbsResult<bool> {
        let mut auction = auction.clone();
        auction.state = AuctionState::Pending;
        auction.updated_at = self.now();
        auction.validate()?;

        match self.create_record("request stop auction", &auction).await {
            Ok(_) => {
                info!(instances = auction.instances, "stop auction requested");
                Ok(true)
            }
            Err(BbsError::Store(StoreError::KeyExists(key))) => {
                let existing: Stored<LrpStopAuction> = self.fetch(&key)?;
                if existing.record.state == AuctionState::Pending
                    && existing.record.instances != auction.instances
                {
                    self.swap_record("coalesce stop auction", existing.index, &auction)
                        .await?;
                    info!(instances = auction.instances, "pending stop auction updated");
                    Ok(true)
                } else {
                    debug!("stop auction already requested");
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn claim_lrp_stop_auction(&self, process_guid: &str) -> BbsResult<()> {
        let Stored { key, index, record } =
            self.fetch::<LrpStopAuction>(&keys::stop_auction_key(process_guid))?;
        if record.state != AuctionState::Pending {
            return Err(BbsError::transition(
                STOP_RECORD,
                &key,
                record.state,
                AuctionState::Claimed,
            ));
        }

        let mut auction = record;
        auction.state = AuctionState::Claimed;
        auction.updated_at = self.now();
        self.swap_record("claim stop auction", index, &auction).await?;
        debug!("stop auction claimed");
        Ok(())
    }

    /// Delete a claimed stop auction and the excess instance records.
    ///
    /// Returns the removed instances so the caller can stop their
    /// containers.
    #[instrument(skip(self))]
    pub async fn resolve_lrp_stop_auction(&self, process_guid: &str) -> BbsResult<Vec<ActualLrp>> {
        let Stored { key, index, record } =
            self.fetch::<LrpStopAuction>(&keys::stop_auction_key(process_guid))?;
        if record.state != AuctionState::Claimed {
            return Err(BbsError::TransitionNotAllowed {
                record: STOP_RECORD,
                key,
                from: record.state.to_string(),
                to: "Deleted".to_string(),
            });
        }

        let limit = i64::from(record.instances);
        let excess: Vec<Stored<ActualLrp>> = self
            .scan::<ActualLrp>(&keys::actual_lrp_process_dir(process_guid))?
            .records
            .into_iter()
            .filter(|stored| {
                !is_evacuating_key(&stored.key)
                    && i64::from(stored.record.key.index) >= limit
            })
            .collect();

        let mut removed = Vec::with_capacity(excess.len());
        for stored in excess {
            match self
                .delete_at("remove excess actual lrp", stored.index, &stored.key)
                .await
            {
                Ok(()) => removed.push(stored.record),
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(key = %stored.key, "excess instance changed, skipping");
                }
                Err(e) => warn!(key = %stored.key, error = %e, "failed to remove excess instance"),
            }
        }

        self.delete_at("resolve stop auction", index, &key).await?;
        info!(removed = removed.len(), "stop auction resolved");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulletin_core::{ActualLrpContainerKey, ActualLrpKey, ActualLrpNetInfo, DesiredLrp};

    use super::*;
    use crate::testing::{T0, bbs};

    fn start(index: i32) -> LrpStartAuction {
        LrpStartAuction::new(DesiredLrp::new("p", "d", "s", 3), index, 0)
    }

    #[tokio::test]
    async fn start_auction_lifecycle() {
        let (bbs, clock) = bbs();
        bbs.request_lrp_start_auction(&start(1)).await.unwrap();

        let pending = bbs.lrp_start_auctions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, AuctionState::Pending);
        assert_eq!(pending[0].updated_at, T0);

        let err = bbs.request_lrp_start_auction(&start(1)).await.unwrap_err();
        assert!(matches!(err, BbsError::AlreadyExists { .. }));

        assert!(bbs.resolve_lrp_start_auction("p", 1).await.is_err());
        clock.advance(Duration::from_secs(1));
        bbs.claim_lrp_start_auction("p", 1).await.unwrap();
        assert!(bbs.claim_lrp_start_auction("p", 1).await.is_err());

        bbs.resolve_lrp_start_auction("p", 1).await.unwrap();
        assert!(bbs.lrp_start_auctions().unwrap().is_empty());
        assert!(bbs.store().get("/v1/start_auction/p").is_err());
    }

    #[tokio::test]
    async fn stop_auction_requests_coalesce() {
        let (bbs, _) = bbs();
        let stop = |instances| LrpStopAuction::new("p", instances, 0);
        assert!(bbs.request_lrp_stop_auction(&stop(3)).await.unwrap());
        assert!(bbs.request_lrp_stop_auction(&stop(2)).await.unwrap());
        assert!(!bbs.request_lrp_stop_auction(&stop(2)).await.unwrap());

        let auctions = bbs.lrp_stop_auctions().unwrap();
        assert_eq!(auctions.len(), 1);
        assert_eq!(auctions[0].instances, 2);
    }

    #[tokio::test]
    async fn resolve_stop_auction_removes_excess() {
        let (bbs, _) = bbs();
        for index in 0..3 {
            bbs.start_actual_lrp(
                &ActualLrpKey::new("p", index, "d"),
                &ActualLrpContainerKey::new(&format!("ig-{index}"), "cellA"),
                &ActualLrpNetInfo::new("10.0.0.1", vec![]),
            )
            .await
            .unwrap();
        }

        bbs.request_lrp_stop_auction(&LrpStopAuction::new("p", 1, 0))
            .await
            .unwrap();
        assert!(bbs.resolve_lrp_stop_auction("p").await.is_err());
        bbs.claim_lrp_stop_auction("p").await.unwrap();

        let mut removed = bbs.resolve_lrp_stop_auction("p").await.unwrap();
        removed.sort_by_key(|lrp| lrp.key.index);
        assert_eq!(
            removed.iter().map(|lrp| lrp.key.index).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let left = bbs.actual_lrps_by_process_guid("p").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key.index, 0);
        assert!(bbs.lrp_stop_auctions().unwrap().is_empty());
    }
}
