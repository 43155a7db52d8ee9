//! Key path derivation for the `/v1` schema.
//!
//! Consumers outside this repository depend on these paths; they are
//! stable.

pub const SCHEMA_ROOT: &str = "/v1";
pub const TASK_SCHEMA_ROOT: &str = "/v1/task";
pub const DESIRED_LRP_SCHEMA_ROOT: &str = "/v1/desired";
pub const ACTUAL_LRP_SCHEMA_ROOT: &str = "/v1/actual";
pub const START_AUCTION_SCHEMA_ROOT: &str = "/v1/start_auction";
pub const STOP_AUCTION_SCHEMA_ROOT: &str = "/v1/stop_auction";
pub const CELL_SCHEMA_ROOT: &str = "/v1/cell";
pub const AUCTIONEER_SCHEMA_ROOT: &str = "/v1/auctioneer";
pub const FRESHNESS_SCHEMA_ROOT: &str = "/v1/freshness";
pub const LOCK_SCHEMA_ROOT: &str = "/v1/lock";

/// Leaf name of the evacuating sibling under an actual LRP key.
pub const EVACUATING_LEAF: &str = "evacuating";

/// Lock name held by the convergence owner.
pub const CONVERGER_LOCK: &str = "converger";

/// Lock name held by the active auctioneer.
pub const AUCTIONEER_LOCK: &str = "auctioneer";

pub fn task_key(task_guid: &str) -> String {
    format!("{TASK_SCHEMA_ROOT}/{task_guid}")
}

pub fn desired_lrp_key(process_guid: &str) -> String {
    format!("{DESIRED_LRP_SCHEMA_ROOT}/{process_guid}")
}

/// Directory holding every actual LRP index of a process.
pub fn actual_lrp_process_dir(process_guid: &str) -> String {
    format!("{ACTUAL_LRP_SCHEMA_ROOT}/{process_guid}")
}

pub fn actual_lrp_key(process_guid: &str, index: i32) -> String {
    format!("{ACTUAL_LRP_SCHEMA_ROOT}/{process_guid}/{index}")
}

pub fn evacuating_actual_lrp_key(process_guid: &str, index: i32) -> String {
    format!("{ACTUAL_LRP_SCHEMA_ROOT}/{process_guid}/{index}/{EVACUATING_LEAF}")
}

pub fn start_auction_key(process_guid: &str, index: i32) -> String {
    format!("{START_AUCTION_SCHEMA_ROOT}/{process_guid}/{index}")
}

pub fn stop_auction_key(process_guid: &str) -> String {
    format!("{STOP_AUCTION_SCHEMA_ROOT}/{process_guid}")
}

pub fn cell_key(cell_id: &str) -> String {
    format!("{CELL_SCHEMA_ROOT}/{cell_id}")
}

pub fn auctioneer_key(auctioneer_id: &str) -> String {
    format!("{AUCTIONEER_SCHEMA_ROOT}/{auctioneer_id}")
}

pub fn freshness_key(domain: &str) -> String {
    format!("{FRESHNESS_SCHEMA_ROOT}/{domain}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_SCHEMA_ROOT}/{name}")
}

/// Last path segment of a key.
pub fn leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Split `/v1/<root>/<process_guid>/<index>` into its guid and index.
///
/// Returns `None` when the key is not under `root` or the index is not a
/// number.
pub fn parse_indexed_key<'a>(root: &str, key: &'a str) -> Option<(&'a str, i32)> {
    let rest = key.strip_prefix(root)?.strip_prefix('/')?;
    let (process_guid, index) = rest.split_once('/')?;
    if process_guid.is_empty() || index.contains('/') {
        return None;
    }
    Some((process_guid, index.parse().ok()?))
}
