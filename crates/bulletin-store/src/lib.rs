//! bulletin-store: the KV gateway every bulletin component writes through.
//!
//! Backed by [redb](https://docs.rs/redb), provides a hierarchical key/value
//! store with create-if-absent, compare-and-swap (by value and by index),
//! recursive and leaf-only deletes, per-key TTLs, and prefix watches.
//!
//! # Architecture
//!
//! Values are opaque bytes; JSON belongs to `bulletin-core`. The
//! [`KvStore`] trait is the contract higher layers depend on, and
//! [`RedbStore`] is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! so it can be shared across async tasks. Writes that hit a transient
//! error go through [`retry::retry_indefinitely`].

pub mod error;
pub mod node;
pub mod retry;
pub mod store;
pub mod tables;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use node::{StoreNode, WatchEvent};
pub use retry::{RetryPolicy, retry_indefinitely};
pub use store::{KvStore, RedbStore};
pub use watch::{Watch, WatchCancel};
