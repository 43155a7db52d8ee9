//! Evacuation: moving instances off a draining cell.
//!
//! A draining cell reports each of its containers through one of the
//! `evacuate_*` calls. A running instance is handed off in two records: the
//! slot at `/v1/actual/<guid>/<index>` goes back to Unclaimed so the
//! auctioneer can place a replacement, and a TTL-bearing copy of the old
//! instance is kept at `/v1/actual/<guid>/<index>/evacuating` so it stays
//! routable until the replacement runs or the TTL runs out.
//!
//! Every call answers whether the cell should keep the container around.

use std::time::Duration;

use bulletin_core::keys::{self, ACTUAL_LRP_SCHEMA_ROOT};
use bulletin_core::{
    ActualLrp, ActualLrpContainerKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState, Record,
};
use bulletin_store::{KvStore, StoreNode};
use tracing::{debug, info, instrument, warn};

use crate::actual::{RECORD, is_evacuating_key};
use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

/// What the evacuating cell should do with its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRetention {
    /// Keep running; the instance is still serving while it is replaced.
    Keep,
    /// Tear the container down.
    Delete,
}

impl<S: KvStore> Bbs<S> {
    /// Every evacuating record.
    pub fn evacuating_actual_lrps(&self) -> BbsResult<Vec<ActualLrp>> {
        Ok(self
            .scan::<ActualLrp>(ACTUAL_LRP_SCHEMA_ROOT)?
            .records
            .into_iter()
            .filter(|stored| is_evacuating_key(&stored.key))
            .map(|stored| stored.record)
            .collect())
    }

    /// A claimed-but-not-started container is dropped and its slot
    /// re-auctioned.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn evacuate_claimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<ContainerRetention> {
        self.remove_own_evacuating(key, container_key).await?;
        if let Some(held) = self.held_instance(key, container_key)? {
            self.unclaim(held, "evacuate claimed actual lrp").await?;
            info!("claimed instance released for re-placement");
        }
        Ok(ContainerRetention::Delete)
    }

    /// A running container hands its slot off and keeps serving until a
    /// replacement runs or `evacuation_ttl` runs out.
    #[instrument(skip(self, net_info), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn evacuate_running_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
        net_info: &ActualLrpNetInfo,
        evacuation_ttl: Duration,
    ) -> BbsResult<ContainerRetention> {
        let path = keys::actual_lrp_key(&key.process_guid, key.index);
        let Some(instance) = self.fetch_optional::<ActualLrp>(&path)? else {
            // The slot is gone: the process is no longer desired.
            self.remove_own_evacuating(key, container_key).await?;
            return Ok(ContainerRetention::Delete);
        };

        let held = instance.record.container_key == *container_key
            && instance.record.state != ActualLrpState::Unclaimed;
        if held {
            let evacuating = ActualLrp {
                key: key.clone(),
                container_key: container_key.clone(),
                net_info: net_info.clone(),
                crash_count: instance.record.crash_count,
                state: ActualLrpState::Running,
                since: self.now(),
                placement_error: String::new(),
            };
            self.put_evacuating(&evacuating, evacuation_ttl).await?;
            self.unclaim(instance, "evacuate running actual lrp").await?;
            info!(ttl = ?evacuation_ttl, "running instance evacuating");
            return Ok(ContainerRetention::Keep);
        }

        if instance.record.state == ActualLrpState::Running {
            // A replacement already runs elsewhere.
            self.remove_own_evacuating(key, container_key).await?;
            debug!("replacement running, evacuation done");
            return Ok(ContainerRetention::Delete);
        }

        // Waiting for the replacement: keep serving while our evacuating
        // record is still alive.
        let own = self
            .fetch_optional::<ActualLrp>(&keys::evacuating_actual_lrp_key(
                &key.process_guid,
                key.index,
            ))?
            .is_some_and(|stored| stored.record.container_key == *container_key);
        Ok(if own {
            ContainerRetention::Keep
        } else {
            ContainerRetention::Delete
        })
    }

    /// The container stopped on its own: forget it.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn evacuate_stopped_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<ContainerRetention> {
        self.remove_own_evacuating(key, container_key).await?;
        if let Some(held) = self.held_instance(key, container_key)? {
            match self
                .delete_at("evacuate stopped actual lrp", held.index, &held.key)
                .await
            {
                Ok(()) => info!("stopped instance removed"),
                Err(e) if e.is_not_found() || e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ContainerRetention::Delete)
    }

    /// The container crashed while draining: count the crash and release
    /// the slot.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn evacuate_crashed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<ContainerRetention> {
        self.remove_own_evacuating(key, container_key).await?;
        if self.held_instance(key, container_key)?.is_some() {
            match self.crash_actual_lrp(key, container_key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() || e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ContainerRetention::Delete)
    }

    /// Delete the evacuating record for the slot, provided it belongs to
    /// `container_key`.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<()> {
        let path = keys::evacuating_actual_lrp_key(&key.process_guid, key.index);
        let Stored { index, record, .. } = self.fetch::<ActualLrp>(&path)?;
        if record.container_key != *container_key {
            return Err(BbsError::TransitionNotAllowed {
                record: RECORD,
                key: path,
                from: record.state.to_string(),
                to: "Deleted".to_string(),
            });
        }
        self.delete_at("remove evacuating actual lrp", index, &path)
            .await?;
        info!("evacuating record removed");
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// The instance record, when `container_key` currently holds it.
    fn held_instance(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<Option<Stored<ActualLrp>>> {
        let path = keys::actual_lrp_key(&key.process_guid, key.index);
        Ok(self.fetch_optional::<ActualLrp>(&path)?.filter(|stored| {
            stored.record.key == *key
                && stored.record.state != ActualLrpState::Unclaimed
                && stored.record.container_key == *container_key
        }))
    }

    async fn unclaim(&self, held: Stored<ActualLrp>, what: &str) -> BbsResult<()> {
        let mut lrp = held.record;
        lrp.demote_to_unclaimed(self.now());
        self.swap_record(what, held.index, &lrp).await?;
        Ok(())
    }

    async fn put_evacuating(&self, lrp: &ActualLrp, ttl: Duration) -> BbsResult<()> {
        lrp.validate()?;
        let path = keys::evacuating_actual_lrp_key(&lrp.key.process_guid, lrp.key.index);
        let node = StoreNode::new(path.as_str(), lrp.to_json()?).with_ttl(ttl);
        match self.fetch_optional::<ActualLrp>(&path)? {
            None => {
                self.write("create evacuating actual lrp", || {
                    self.store.create(node.clone())
                })
                .await?;
            }
            Some(existing) => {
                if existing.record.container_key != lrp.container_key {
                    warn!(key = %path, "replacing evacuating record of another container");
                }
                self.write("refresh evacuating actual lrp", || {
                    self.store
                        .compare_and_swap_by_index(existing.index, node.clone())
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_own_evacuating(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<()> {
        match self.remove_evacuating_actual_lrp(key, container_key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_conflict() => Ok(()),
            Err(BbsError::TransitionNotAllowed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bbs;

    fn key() -> ActualLrpKey {
        ActualLrpKey::new("p", 0, "d")
    }

    fn ck(cell: &str) -> ActualLrpContainerKey {
        ActualLrpContainerKey::new(&format!("ig-{cell}"), cell)
    }

    fn net(address: &str) -> ActualLrpNetInfo {
        ActualLrpNetInfo::new(address, vec![])
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn running_handoff_keeps_container_until_replacement_runs() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"))
            .await
            .unwrap();

        let retention = bbs
            .evacuate_running_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"), TTL)
            .await
            .unwrap();
        assert_eq!(retention, ContainerRetention::Keep);

        let slot = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(slot.state, ActualLrpState::Unclaimed);
        let evacuating = bbs.evacuating_actual_lrps().unwrap();
        assert_eq!(evacuating.len(), 1);
        assert_eq!(evacuating[0].container_key, ck("cellA"));
        assert_eq!(
            bbs.store()
                .get("/v1/actual/p/0/evacuating")
                .unwrap()
                .ttl,
            Some(TTL)
        );
        // The evacuating copy is not listed as an instance.
        assert_eq!(bbs.actual_lrps().unwrap().len(), 1);

        // Still waiting for a replacement.
        let retention = bbs
            .evacuate_running_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"), TTL)
            .await
            .unwrap();
        assert_eq!(retention, ContainerRetention::Keep);

        // The replacement starts on cellB and clears the evacuating record.
        bbs.start_actual_lrp(&key(), &ck("cellB"), &net("10.0.0.2"))
            .await
            .unwrap();
        assert!(bbs.evacuating_actual_lrps().unwrap().is_empty());

        let retention = bbs
            .evacuate_running_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"), TTL)
            .await
            .unwrap();
        assert_eq!(retention, ContainerRetention::Delete);
    }

    #[tokio::test]
    async fn claimed_evacuation_releases_slot() {
        let (bbs, _) = bbs();
        bbs.claim_actual_lrp(&key(), &ck("cellA")).await.unwrap();

        let retention = bbs
            .evacuate_claimed_actual_lrp(&key(), &ck("cellA"))
            .await
            .unwrap();
        assert_eq!(retention, ContainerRetention::Delete);
        let slot = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(slot.state, ActualLrpState::Unclaimed);
    }

    #[tokio::test]
    async fn stopped_evacuation_removes_held_instance_only() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(), &ck("cellB"), &net("10.0.0.2"))
            .await
            .unwrap();

        // cellA no longer holds the slot, so nothing of cellB's is touched.
        bbs.evacuate_stopped_actual_lrp(&key(), &ck("cellA"))
            .await
            .unwrap();
        assert_eq!(bbs.actual_lrps().unwrap().len(), 1);

        bbs.evacuate_stopped_actual_lrp(&key(), &ck("cellB"))
            .await
            .unwrap();
        assert!(bbs.actual_lrps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn crashed_evacuation_counts_crash() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"))
            .await
            .unwrap();

        bbs.evacuate_crashed_actual_lrp(&key(), &ck("cellA"))
            .await
            .unwrap();
        let slot = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(slot.state, ActualLrpState::Unclaimed);
        assert_eq!(slot.crash_count, 1);
    }

    #[tokio::test]
    async fn remove_evacuating_checks_container() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"))
            .await
            .unwrap();
        bbs.evacuate_running_actual_lrp(&key(), &ck("cellA"), &net("10.0.0.1"), TTL)
            .await
            .unwrap();

        assert!(
            bbs.remove_evacuating_actual_lrp(&key(), &ck("cellB"))
                .await
                .is_err()
        );
        bbs.remove_evacuating_actual_lrp(&key(), &ck("cellA"))
            .await
            .unwrap();
        assert!(bbs.evacuating_actual_lrps().unwrap().is_empty());
        assert!(
            bbs.remove_evacuating_actual_lrp(&key(), &ck("cellA"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
