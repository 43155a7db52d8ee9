//! Who is alive: cell and auctioneer presence, and the leases that
//! announce them.

use std::collections::HashMap;
use std::time::Duration;

use bulletin_core::keys::{self, AUCTIONEER_LOCK, CELL_SCHEMA_ROOT, CONVERGER_LOCK};
use bulletin_core::{AuctioneerPresence, CellPresence, Record};
use bulletin_lease::{Lock, Presence, SessionStore};
use bulletin_store::KvStore;

use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

impl<S: KvStore> Bbs<S> {
    /// Every cell currently announcing itself.
    pub fn cells(&self) -> BbsResult<Vec<CellPresence>> {
        self.list(CELL_SCHEMA_ROOT)
    }

    /// Every cell with a key under `/v1/cell`, by cell id.
    ///
    /// The id comes from the key, so a presence that fails to decode still
    /// marks its cell as alive; its entry is `None`.
    pub fn live_cells(&self) -> BbsResult<HashMap<String, Option<CellPresence>>> {
        let scan = self.scan::<CellPresence>(CELL_SCHEMA_ROOT)?;
        let mut cells: HashMap<String, Option<CellPresence>> = scan
            .malformed
            .iter()
            .map(|node| (keys::leaf(&node.key).to_string(), None))
            .collect();
        for Stored { key, record, .. } in scan.records {
            cells.insert(keys::leaf(&key).to_string(), Some(record));
        }
        Ok(cells)
    }

    /// Address of the auctioneer holding the auctioneer lock.
    pub fn auctioneer_address(&self) -> BbsResult<String> {
        match self.fetch_optional::<AuctioneerPresence>(&keys::lock_key(AUCTIONEER_LOCK))? {
            Some(Stored { record, .. }) => Ok(record.address),
            None => Err(BbsError::NoAuctioneer),
        }
    }

    /// The lock that gates convergence. `owner_id` is stored as the lock
    /// value so operators can see who holds it.
    pub fn new_converge_lock<SS: SessionStore>(
        &self,
        sessions: SS,
        owner_id: &str,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Lock<SS> {
        Lock::new(
            sessions,
            &keys::lock_key(CONVERGER_LOCK),
            owner_id,
            ttl,
            retry_interval,
        )
    }

    /// The lock an auctioneer holds while active; its value is the
    /// auctioneer's presence so cells can find it.
    pub fn new_auctioneer_lock<SS: SessionStore>(
        &self,
        sessions: SS,
        presence: &AuctioneerPresence,
        ttl: Duration,
        retry_interval: Duration,
    ) -> BbsResult<Lock<SS>> {
        presence.validate()?;
        Ok(Lock::new(
            sessions,
            &keys::lock_key(AUCTIONEER_LOCK),
            presence.to_json()?,
            ttl,
            retry_interval,
        ))
    }

    /// A cell's self-announcement at `/v1/cell/<cell_id>`.
    pub fn new_cell_presence<SS: SessionStore>(
        &self,
        sessions: SS,
        presence: &CellPresence,
        ttl: Duration,
        retry_interval: Duration,
    ) -> BbsResult<Presence<SS>> {
        presence.validate()?;
        Ok(Presence::new(
            sessions,
            &presence.key(),
            presence.to_json()?,
            ttl,
            retry_interval,
        ))
    }
}

#[cfg(test)]
mod tests {
    use bulletin_lease::KvSessionStore;
    use tokio::sync::{oneshot, watch};

    use super::*;
    use crate::testing::bbs;

    const TTL: Duration = Duration::from_secs(5);
    const RETRY: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn no_auctioneer_until_lock_is_held() {
        let (bbs, _) = bbs();
        assert_eq!(bbs.auctioneer_address(), Err(BbsError::NoAuctioneer));

        let lock = bbs
            .new_auctioneer_lock(
                KvSessionStore::new(bbs.store().clone()),
                &AuctioneerPresence::new("a1", "10.0.0.9:9016"),
                TTL,
                RETRY,
            )
            .unwrap();
        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let run = tokio::spawn(lock.run(shutdown, ready_tx));
        ready_rx.await.unwrap();

        assert_eq!(bbs.auctioneer_address().unwrap(), "10.0.0.9:9016");

        stop.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(bbs.auctioneer_address(), Err(BbsError::NoAuctioneer));
    }

    #[tokio::test]
    async fn cell_presence_is_listed_while_running() {
        let (bbs, _) = bbs();
        let presence = bbs
            .new_cell_presence(
                KvSessionStore::new(bbs.store().clone()),
                &CellPresence::new("cellA", "s", "10.0.0.1:1800"),
                TTL,
                RETRY,
            )
            .unwrap();
        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let run = tokio::spawn(presence.run(shutdown, ready_tx));
        ready_rx.await.unwrap();

        let mut cells = Vec::new();
        for _ in 0..100 {
            cells = bbs.cells().unwrap();
            if !cells.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cells, vec![CellPresence::new("cellA", "s", "10.0.0.1:1800")]);

        stop.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert!(bbs.cells().unwrap().is_empty());
    }

    #[test]
    fn invalid_cell_presence_is_rejected() {
        let (bbs, _) = bbs();
        let err = bbs
            .new_cell_presence(
                KvSessionStore::new(bbs.store().clone()),
                &CellPresence::new("cellA", "s", ""),
                TTL,
                RETRY,
            )
            .err()
            .unwrap();
        assert!(matches!(err, BbsError::Model(_)));
    }

    #[test]
    fn converge_lock_key() {
        let (bbs, _) = bbs();
        let lock = bbs.new_converge_lock(
            KvSessionStore::new(bbs.store().clone()),
            "bulletind-0",
            TTL,
            RETRY,
        );
        assert_eq!(lock.key(), "/v1/lock/converger");
    }

    #[test]
    fn undecodable_cell_is_still_live() {
        let (bbs, _) = bbs();
        bbs.store()
            .set(bulletin_store::StoreNode::new(
                "/v1/cell/cellA",
                br#"{"cell_id":"cellA","stack":"","rep_address":"http://a"}"#.to_vec(),
            ))
            .unwrap();
        let good = CellPresence::new("cellB", "s", "10.0.0.2:1800");
        bbs.store()
            .set(bulletin_store::StoreNode::new(good.key(), good.to_json().unwrap()))
            .unwrap();

        let live = bbs.live_cells().unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live.get("cellA"), Some(&None));
        assert_eq!(live.get("cellB"), Some(&Some(good.clone())));
        assert_eq!(bbs.cells().unwrap(), vec![good]);
    }
}
