//! bulletin-lease: time-bounded exclusive assertions in the KV store.
//!
//! A [`Session`] holds leases (TTL-bearing keys it keeps renewing). On top
//! of sessions sit two long-lived runners:
//!
//! - [`Lock`]: single holder. Signals ready once acquired and exits with
//!   [`LeaseError::LockLost`] if the lease is invalidated.
//! - [`Presence`]: self-announcement. Signals ready immediately and keeps
//!   re-announcing on loss or contention until shut down.
//!
//! Both runners are driven by `run(shutdown, ready)` and are restartable
//! by constructing a fresh instance.

pub mod error;
pub mod lock;
pub mod presence;
pub mod session;

pub use error::{LeaseError, LeaseResult};
pub use lock::Lock;
pub use presence::Presence;
pub use session::{KvSession, KvSessionStore, LostSignal, Session, SessionStore};
