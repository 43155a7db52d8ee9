//! Physical removal of expired TTL keys.
//!
//! Reads already treat expired keys as absent; sweeping turns the expiry
//! into real deletes so watchers (lease holders, the converger's cell
//! watch) hear about it.

use std::time::Duration;

use bulletin_store::KvStore;
use tokio::sync::watch;
use tracing::{info, warn};

/// Purge expired keys every `interval` until `shutdown` flips.
pub async fn run<S: KvStore>(store: S, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_ms = interval.as_millis() as u64, "ttl sweeper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => sweep(&store),
            _ = shutdown.changed() => {
                info!("ttl sweeper shutting down");
                break;
            }
        }
    }
}

fn sweep<S: KvStore>(store: &S) {
    if let Err(e) = store.purge_expired() {
        warn!(error = %e, "failed to purge expired keys");
    }
}
