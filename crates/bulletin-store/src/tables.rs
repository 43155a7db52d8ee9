//! redb table definitions for the KV gateway.
//!
//! Every key lives in one flat table; the hierarchy is implied by `/`
//! separators and reconstructed on listing.

use redb::TableDefinition;

/// Entries keyed by full path. Values are an [`crate::node::Entry`] header
/// followed by the opaque payload.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last modification index handed out.
pub const INDEX_KEY: &str = "modified_index";
