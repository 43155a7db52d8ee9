//! Self-announcement runner.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::error::LeaseResult;
use crate::session::{Session, SessionStore};

/// Keeps a presence key announced until shutdown.
///
/// Presence is best effort: `ready` is signalled immediately, and a lost
/// or contended presence is retried forever after `retry_interval` on a
/// recreated session.
pub struct Presence<S: SessionStore> {
    sessions: S,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    retry_interval: Duration,
}

impl<S: SessionStore> Presence<S> {
    pub fn new(
        sessions: S,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            key: key.to_string(),
            value: value.into(),
            ttl,
            retry_interval,
        }
    }

    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> LeaseResult<()> {
        let key = self.key.as_str();
        let session = self.sessions.create_session(self.ttl).await?;
        let _ = ready.send(());

        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        loop {
            match session.set_presence(key, &self.value).await {
                Ok(mut lost) => {
                    tokio::select! {
                        _ = lost.lost() => warn!(%key, "presence lost"),
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => warn!(%key, error = %e, "failed to set presence"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = session.recreate().await {
                warn!(%key, error = %e, "failed to recreate session");
            }
        }

        info!(%key, "removing presence on shutdown");
        if let Err(e) = session.destroy().await {
            warn!(%key, error = %e, "failed to remove presence");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bulletin_store::{KvStore, RedbStore};

    use super::*;
    use crate::session::KvSessionStore;

    #[tokio::test]
    async fn announces_and_withdraws() {
        let store = RedbStore::open_in_memory().unwrap();
        let presence = Presence::new(
            KvSessionStore::new(store.clone()),
            "/v1/cell/cellA",
            "{}",
            Duration::from_secs(5),
            Duration::from_millis(50),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(presence.run(shutdown_rx, ready_tx));
        ready_rx.await.unwrap();

        let mut attempts = 0;
        while store.get("/v1/cell/cellA").is_err() && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            attempts += 1;
        }
        assert_eq!(store.get("/v1/cell/cellA").unwrap().value, b"{}");

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert!(store.get("/v1/cell/cellA").is_err());
    }
}
