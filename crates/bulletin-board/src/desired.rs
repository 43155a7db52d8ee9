//! Desired LRPs and domain freshness.

use std::time::Duration;

use bulletin_core::keys::{self, DESIRED_LRP_SCHEMA_ROOT, FRESHNESS_SCHEMA_ROOT};
use bulletin_core::{DesiredLrp, DesiredLrpUpdate, Freshness, Record};
use bulletin_store::{KvStore, StoreError, StoreNode};
use tracing::{debug, info, instrument};

use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

const RECORD: &str = "desired lrp";

impl<S: KvStore> Bbs<S> {
    // ── Lookups ───────────────────────────────────────────────────

    pub fn desired_lrps(&self) -> BbsResult<Vec<DesiredLrp>> {
        self.list(DESIRED_LRP_SCHEMA_ROOT)
    }

    pub fn desired_lrps_by_domain(&self, domain: &str) -> BbsResult<Vec<DesiredLrp>> {
        let mut lrps = self.desired_lrps()?;
        lrps.retain(|lrp| lrp.domain == domain);
        Ok(lrps)
    }

    pub fn desired_lrp_by_process_guid(&self, process_guid: &str) -> BbsResult<DesiredLrp> {
        let stored: Stored<DesiredLrp> = self.fetch(&keys::desired_lrp_key(process_guid))?;
        Ok(stored.record)
    }

    /// Domains whose freshness beacon is currently alive.
    pub fn freshnesses(&self) -> BbsResult<Vec<Freshness>> {
        self.list(FRESHNESS_SCHEMA_ROOT)
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Create a desired LRP. An existing one is left untouched.
    #[instrument(skip(self, lrp), fields(process_guid = %lrp.process_guid))]
    pub async fn desire_lrp(&self, lrp: &DesiredLrp) -> BbsResult<()> {
        lrp.validate()?;
        match self.create_record("desire lrp", lrp).await {
            Ok(_) => {
                info!(instances = lrp.instances, "lrp desired");
                Ok(())
            }
            Err(BbsError::Store(StoreError::KeyExists(key))) => Err(BbsError::AlreadyExists {
                record: RECORD,
                key,
            }),
            Err(e) => Err(e),
        }
    }

    /// Replace the stored desired LRP with `updated`.
    ///
    /// Fails with the offending fields, before any write, when `updated`
    /// changes anything besides `instances`, `routes`, or `annotation`.
    #[instrument(skip(self, updated), fields(process_guid = %updated.process_guid))]
    pub async fn update_desired_lrp(&self, updated: &DesiredLrp) -> BbsResult<()> {
        let Stored { index, record, .. } =
            self.fetch::<DesiredLrp>(&keys::desired_lrp_key(&updated.process_guid))?;
        record.validate_modifications(updated)?;
        if record == *updated {
            debug!("desired lrp unchanged");
            return Ok(());
        }
        self.swap_record("update desired lrp", index, updated)
            .await?;
        info!(instances = updated.instances, "desired lrp updated");
        Ok(())
    }

    /// Apply the mutable-field `update` to the stored desired LRP.
    pub async fn change_desired_lrp(
        &self,
        process_guid: &str,
        update: &DesiredLrpUpdate,
    ) -> BbsResult<DesiredLrp> {
        let current = self.desired_lrp_by_process_guid(process_guid)?;
        let updated = current.apply(update);
        self.update_desired_lrp(&updated).await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn remove_desired_lrp_by_process_guid(&self, process_guid: &str) -> BbsResult<()> {
        let Stored { key, index, .. } =
            self.fetch::<DesiredLrp>(&keys::desired_lrp_key(process_guid))?;
        self.delete_at("remove desired lrp", index, &key).await?;
        info!("desired lrp removed");
        Ok(())
    }

    /// Assert authority over `freshness.domain` for `ttl_in_seconds`
    /// (forever when zero).
    #[instrument(skip(self, freshness), fields(domain = %freshness.domain))]
    pub async fn bump_freshness(&self, freshness: &Freshness) -> BbsResult<()> {
        freshness.validate()?;
        let node = StoreNode::new(freshness.key(), freshness.to_json()?)
            .with_ttl(Duration::from_secs(freshness.ttl_in_seconds));
        self.write("bump freshness", || self.store.set(node.clone()))
            .await?;
        debug!(ttl_in_seconds = freshness.ttl_in_seconds, "freshness bumped");
        Ok(())
    }
}
