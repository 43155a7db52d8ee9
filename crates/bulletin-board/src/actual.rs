//! Actual LRP state machine.
//!
//! Every write is gated by [`ActualLrp::allows_transition_to`]: the caller
//! names the instance slot and its own container key, and a cell can only
//! move an instance it holds (or one nobody holds).

use bulletin_core::keys::{self, ACTUAL_LRP_SCHEMA_ROOT, EVACUATING_LEAF};
use bulletin_core::{
    ActualLrp, ActualLrpContainerKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState, Record,
};
use bulletin_store::KvStore;
use tracing::{debug, info, instrument, warn};

use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

pub(crate) const RECORD: &str = "actual lrp";

/// Whether `key` names the evacuating child of an instance slot.
pub fn is_evacuating_key(key: &str) -> bool {
    key.starts_with(ACTUAL_LRP_SCHEMA_ROOT) && keys::leaf(key) == EVACUATING_LEAF
}

impl<S: KvStore> Bbs<S> {
    // ── Lookups ───────────────────────────────────────────────────

    /// Every instance record, without evacuating ones.
    pub fn actual_lrps(&self) -> BbsResult<Vec<ActualLrp>> {
        Ok(self
            .scan::<ActualLrp>(ACTUAL_LRP_SCHEMA_ROOT)?
            .records
            .into_iter()
            .filter(|stored| !is_evacuating_key(&stored.key))
            .map(|stored| stored.record)
            .collect())
    }

    pub fn actual_lrps_by_process_guid(&self, process_guid: &str) -> BbsResult<Vec<ActualLrp>> {
        let dir = keys::actual_lrp_process_dir(process_guid);
        Ok(self
            .scan::<ActualLrp>(&dir)?
            .records
            .into_iter()
            .filter(|stored| !is_evacuating_key(&stored.key))
            .map(|stored| stored.record)
            .collect())
    }

    pub fn actual_lrps_by_cell_id(&self, cell_id: &str) -> BbsResult<Vec<ActualLrp>> {
        let mut lrps = self.actual_lrps()?;
        lrps.retain(|lrp| lrp.container_key.cell_id == cell_id);
        Ok(lrps)
    }

    pub fn actual_lrp_by_process_guid_and_index(
        &self,
        process_guid: &str,
        index: i32,
    ) -> BbsResult<ActualLrp> {
        let stored: Stored<ActualLrp> = self.fetch(&keys::actual_lrp_key(process_guid, index))?;
        Ok(stored.record)
    }

    // ── Transitions ───────────────────────────────────────────────

    /// Claim the slot for `container_key`. Claiming again with the same
    /// container key is a no-op.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<()> {
        let mut lrp = ActualLrp {
            key: key.clone(),
            container_key: container_key.clone(),
            state: ActualLrpState::Claimed,
            since: self.now(),
            ..Default::default()
        };

        let existing = self.fetch_optional::<ActualLrp>(&lrp.key())?;
        match existing {
            None => {
                lrp.validate()?;
                self.create_record("claim actual lrp", &lrp).await?;
            }
            Some(Stored { key: path, index, record }) => {
                if !record.allows_transition_to(key, container_key, ActualLrpState::Claimed) {
                    return Err(BbsError::transition(
                        RECORD,
                        &path,
                        record.state,
                        ActualLrpState::Claimed,
                    ));
                }
                if record.state == ActualLrpState::Claimed {
                    debug!("already claimed by this container");
                    return Ok(());
                }
                lrp.crash_count = record.crash_count;
                lrp.validate()?;
                self.swap_record("claim actual lrp", index, &lrp).await?;
            }
        }
        info!(cell_id = %container_key.cell_id, "actual lrp claimed");
        Ok(())
    }

    /// Mark the slot Running in `container_key` at `net_info`.
    ///
    /// Once the instance runs, an evacuating record left by a different
    /// container for the same slot is no longer needed and is removed.
    #[instrument(skip(self, net_info), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
        net_info: &ActualLrpNetInfo,
    ) -> BbsResult<()> {
        let mut lrp = ActualLrp {
            key: key.clone(),
            container_key: container_key.clone(),
            net_info: net_info.clone(),
            state: ActualLrpState::Running,
            since: self.now(),
            ..Default::default()
        };

        let existing = self.fetch_optional::<ActualLrp>(&lrp.key())?;
        match existing {
            None => {
                lrp.validate()?;
                self.create_record("start actual lrp", &lrp).await?;
                info!(cell_id = %container_key.cell_id, "actual lrp started");
            }
            Some(Stored { key: path, index, record }) => {
                if !record.allows_transition_to(key, container_key, ActualLrpState::Running) {
                    return Err(BbsError::transition(
                        RECORD,
                        &path,
                        record.state,
                        ActualLrpState::Running,
                    ));
                }
                if record.state == ActualLrpState::Running && record.net_info == *net_info {
                    debug!("already running in this container");
                } else {
                    lrp.crash_count = record.crash_count;
                    lrp.validate()?;
                    self.swap_record("start actual lrp", index, &lrp).await?;
                    info!(cell_id = %container_key.cell_id, "actual lrp started");
                }
            }
        }

        self.remove_foreign_evacuating(key, container_key).await;
        Ok(())
    }

    async fn remove_foreign_evacuating(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) {
        let path = keys::evacuating_actual_lrp_key(&key.process_guid, key.index);
        let evacuating = match self.fetch_optional::<ActualLrp>(&path) {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!(key = %path, error = %e, "could not read evacuating record");
                return;
            }
        };
        if evacuating.record.container_key == *container_key {
            return;
        }
        match self
            .delete_at("remove evacuating actual lrp", evacuating.index, &path)
            .await
        {
            Ok(()) => info!(key = %path, "replacement running, evacuating record removed"),
            Err(e) if e.is_not_found() || e.is_conflict() => {}
            Err(e) => warn!(key = %path, error = %e, "failed to remove evacuating record"),
        }
    }

    /// The instance in `container_key` crashed: back to Unclaimed and bump
    /// the crash count.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<()> {
        let Stored { key: path, index, record } =
            self.fetch::<ActualLrp>(&keys::actual_lrp_key(&key.process_guid, key.index))?;
        if record.state == ActualLrpState::Unclaimed
            || !record.allows_transition_to(key, container_key, ActualLrpState::Unclaimed)
        {
            return Err(BbsError::transition(
                RECORD,
                &path,
                record.state,
                ActualLrpState::Unclaimed,
            ));
        }

        let mut lrp = record;
        lrp.demote_to_unclaimed(self.now());
        lrp.crash_count += 1;
        self.swap_record("crash actual lrp", index, &lrp).await?;
        info!(crash_count = lrp.crash_count, "actual lrp crashed");
        Ok(())
    }

    /// Delete the slot, provided `container_key` still holds it.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn remove_actual_lrp(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
    ) -> BbsResult<()> {
        let Stored { key: path, index, record } =
            self.fetch::<ActualLrp>(&keys::actual_lrp_key(&key.process_guid, key.index))?;
        if record.key != *key || record.container_key != *container_key {
            return Err(BbsError::TransitionNotAllowed {
                record: RECORD,
                key: path,
                from: record.state.to_string(),
                to: "Deleted".to_string(),
            });
        }

        self.delete_at("remove actual lrp", index, &path).await?;
        info!("actual lrp removed");
        Ok(())
    }

    /// Record why an unclaimed slot could not be placed.
    #[instrument(skip(self), fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn fail_actual_lrp(&self, key: &ActualLrpKey, placement_error: &str) -> BbsResult<()> {
        let Stored { key: path, index, record } =
            self.fetch::<ActualLrp>(&keys::actual_lrp_key(&key.process_guid, key.index))?;
        if record.key != *key || record.state != ActualLrpState::Unclaimed {
            return Err(BbsError::transition(
                RECORD,
                &path,
                record.state,
                ActualLrpState::Unclaimed,
            ));
        }

        let mut lrp = record;
        lrp.placement_error = placement_error.to_string();
        self.swap_record("fail actual lrp", index, &lrp).await?;
        info!(placement_error, "actual lrp placement failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulletin_core::PortMapping;

    use super::*;
    use crate::testing::{T0, bbs};

    fn key(index: i32) -> ActualLrpKey {
        ActualLrpKey::new("p", index, "d")
    }

    fn ck(cell: &str) -> ActualLrpContainerKey {
        ActualLrpContainerKey::new(&format!("ig-{cell}"), cell)
    }

    fn net() -> ActualLrpNetInfo {
        ActualLrpNetInfo::new(
            "10.0.0.1",
            vec![PortMapping {
                container_port: 8080,
                host_port: 61000,
            }],
        )
    }

    #[tokio::test]
    async fn claim_creates_and_is_idempotent() {
        let (bbs, clock) = bbs();
        bbs.claim_actual_lrp(&key(0), &ck("cellA")).await.unwrap();

        clock.advance(Duration::from_secs(1));
        bbs.claim_actual_lrp(&key(0), &ck("cellA")).await.unwrap();

        let lrp = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(lrp.state, ActualLrpState::Claimed);
        assert_eq!(lrp.since, T0);

        let err = bbs.claim_actual_lrp(&key(0), &ck("cellB")).await.unwrap_err();
        assert!(matches!(err, BbsError::TransitionNotAllowed { .. }));
    }

    #[tokio::test]
    async fn start_from_claimed_records_net_info() {
        let (bbs, _) = bbs();
        bbs.claim_actual_lrp(&key(0), &ck("cellA")).await.unwrap();
        bbs.start_actual_lrp(&key(0), &ck("cellA"), &net())
            .await
            .unwrap();

        let lrp = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(lrp.state, ActualLrpState::Running);
        assert_eq!(lrp.net_info, net());

        assert!(
            bbs.start_actual_lrp(&key(0), &ck("cellB"), &net())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn crash_demotes_and_counts() {
        let (bbs, clock) = bbs();
        bbs.start_actual_lrp(&key(0), &ck("cellA"), &net())
            .await
            .unwrap();

        assert!(bbs.crash_actual_lrp(&key(0), &ck("cellB")).await.is_err());

        clock.advance(Duration::from_secs(5));
        bbs.crash_actual_lrp(&key(0), &ck("cellA")).await.unwrap();
        let lrp = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(lrp.state, ActualLrpState::Unclaimed);
        assert!(lrp.container_key.is_empty());
        assert_eq!(lrp.crash_count, 1);
        assert_eq!(lrp.since, T0 + 5_000_000_000);

        // Nothing left to crash.
        assert!(bbs.crash_actual_lrp(&key(0), &ck("cellA")).await.is_err());

        // The count survives the next claim.
        bbs.claim_actual_lrp(&key(0), &ck("cellB")).await.unwrap();
        let lrp = bbs.actual_lrp_by_process_guid_and_index("p", 0).unwrap();
        assert_eq!(lrp.crash_count, 1);
    }

    #[tokio::test]
    async fn remove_refuses_stale_container() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(0), &ck("cellA"), &net())
            .await
            .unwrap();

        let err = bbs.remove_actual_lrp(&key(0), &ck("cellB")).await.unwrap_err();
        assert!(matches!(err, BbsError::TransitionNotAllowed { .. }));
        assert_eq!(bbs.actual_lrps().unwrap().len(), 1);

        bbs.remove_actual_lrp(&key(0), &ck("cellA")).await.unwrap();
        assert!(bbs.actual_lrps().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_only_when_unclaimed() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(0), &ck("cellA"), &net())
            .await
            .unwrap();
        assert!(bbs.fail_actual_lrp(&key(0), "no room").await.is_err());

        bbs.crash_actual_lrp(&key(0), &ck("cellA")).await.unwrap();
        bbs.fail_actual_lrp(&key(0), "no room").await.unwrap();
        assert_eq!(
            bbs.actual_lrp_by_process_guid_and_index("p", 0)
                .unwrap()
                .placement_error,
            "no room"
        );
    }

    #[tokio::test]
    async fn lookups_split_by_cell_and_process() {
        let (bbs, _) = bbs();
        bbs.start_actual_lrp(&key(0), &ck("cellA"), &net())
            .await
            .unwrap();
        bbs.claim_actual_lrp(&key(1), &ck("cellB")).await.unwrap();
        bbs.claim_actual_lrp(&ActualLrpKey::new("q", 0, "d"), &ck("cellA"))
            .await
            .unwrap();

        assert_eq!(bbs.actual_lrps().unwrap().len(), 3);
        assert_eq!(bbs.actual_lrps_by_process_guid("p").unwrap().len(), 2);
        assert_eq!(bbs.actual_lrps_by_cell_id("cellA").unwrap().len(), 2);
    }

    #[test]
    fn evacuating_key_detection() {
        assert!(is_evacuating_key("/v1/actual/p/0/evacuating"));
        assert!(!is_evacuating_key("/v1/actual/p/0"));
        assert!(!is_evacuating_key("/v1/task/evacuating"));
    }
}
