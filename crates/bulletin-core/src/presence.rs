//! Self-announcements and per-domain freshness beacons.

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::keys;
use crate::record::{Record, require};

/// A worker host announcing that it is alive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPresence {
    pub cell_id: String,
    pub stack: String,
    pub rep_address: String,
}

impl CellPresence {
    pub fn new(cell_id: &str, stack: &str, rep_address: &str) -> Self {
        Self {
            cell_id: cell_id.to_string(),
            stack: stack.to_string(),
            rep_address: rep_address.to_string(),
        }
    }
}

impl Record for CellPresence {
    fn key(&self) -> String {
        keys::cell_key(&self.cell_id)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require(&mut errs, "cell_id", &self.cell_id);
        require(&mut errs, "stack", &self.stack);
        require(&mut errs, "rep_address", &self.rep_address);
        errs.into_result()
    }
}

/// The active auctioneer's address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctioneerPresence {
    pub auctioneer_id: String,
    pub address: String,
}

impl AuctioneerPresence {
    pub fn new(auctioneer_id: &str, address: &str) -> Self {
        Self {
            auctioneer_id: auctioneer_id.to_string(),
            address: address.to_string(),
        }
    }
}

impl Record for AuctioneerPresence {
    fn key(&self) -> String {
        keys::auctioneer_key(&self.auctioneer_id)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require(&mut errs, "auctioneer_id", &self.auctioneer_id);
        require(&mut errs, "address", &self.address);
        errs.into_result()
    }
}

/// While present, convergence may act destructively in `domain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    pub domain: String,
    /// Zero means the beacon never expires.
    #[serde(default)]
    pub ttl_in_seconds: u64,
}

impl Record for Freshness {
    fn key(&self) -> String {
        keys::freshness_key(&self.domain)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require(&mut errs, "domain", &self.domain);
        errs.into_result()
    }
}
