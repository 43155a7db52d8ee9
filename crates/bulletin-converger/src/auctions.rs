//! Start and stop auction convergence.
//!
//! A pending auction the auctioneer has not picked up for
//! `kick_pending_duration` is rewritten with a fresh timestamp, which
//! republishes it to watchers. A claimed auction left for
//! `expire_claimed_duration` belongs to an auctioneer that died mid-auction
//! and is deleted; the LRP pass requests a new one if it is still needed.

use bulletin_core::keys::{START_AUCTION_SCHEMA_ROOT, STOP_AUCTION_SCHEMA_ROOT};
use bulletin_core::{AuctionState, LrpStartAuction, LrpStopAuction, Record};
use bulletin_store::KvStore;
use tracing::{info, instrument};

use crate::batch::{Batch, Effect};
use crate::cell_client::CellClient;
use crate::error::ConvergeResult;
use crate::stats::ConvergeStats;
use crate::{Converger, encode, older_than};

trait Auction: Record {
    fn state(&self) -> AuctionState;
    fn updated_at(&self) -> i64;
    fn touch(&mut self, now: i64);
}

impl Auction for LrpStartAuction {
    fn state(&self) -> AuctionState {
        self.state
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }
}

impl Auction for LrpStopAuction {
    fn state(&self) -> AuctionState {
        self.state
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }
}

impl<S: KvStore, C: CellClient> Converger<S, C> {
    #[instrument(skip(self))]
    pub async fn converge_start_auctions(&self) -> ConvergeResult<ConvergeStats> {
        self.converge_auctions::<LrpStartAuction>(START_AUCTION_SCHEMA_ROOT, "start auctions converged")
            .await
    }

    #[instrument(skip(self))]
    pub async fn converge_stop_auctions(&self) -> ConvergeResult<ConvergeStats> {
        self.converge_auctions::<LrpStopAuction>(STOP_AUCTION_SCHEMA_ROOT, "stop auctions converged")
            .await
    }

    async fn converge_auctions<A: Auction>(
        &self,
        root: &str,
        summary: &'static str,
    ) -> ConvergeResult<ConvergeStats> {
        let scan = self.bbs.scan::<A>(root)?;
        let now = self.now();
        let cfg = &self.config;

        let mut batch = Batch::default();
        for node in &scan.malformed {
            batch.delete(node.index, node.key.as_str(), Effect::MalformedDeleted);
        }

        for stored in scan.records {
            let mut auction = stored.record;
            match auction.state() {
                AuctionState::Pending
                    if older_than(now, auction.updated_at(), cfg.kick_pending_duration) =>
                {
                    auction.touch(now);
                    if let Some(node) = encode(&stored.key, &auction) {
                        batch.swap(stored.index, node, Effect::AuctionKicked);
                    }
                }
                AuctionState::Claimed
                    if older_than(now, auction.updated_at(), cfg.expire_claimed_duration) =>
                {
                    batch.delete(stored.index, stored.key, Effect::AuctionExpired);
                }
                _ => {}
            }
        }

        let mut stats = ConvergeStats::default();
        batch.apply(self.bbs.store(), &mut stats).await;
        if stats.writes() > 0 {
            info!(
                kicked = stats.auctions_kicked,
                expired = stats.auctions_expired,
                malformed_deleted = stats.malformed_deleted,
                conflicts = stats.conflicts,
                "{summary}"
            );
        }
        Ok(stats)
    }
}
