//! Single-holder lock runner.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::error::{LeaseError, LeaseResult};
use crate::session::{Session, SessionStore};

/// Contends for one lock key and holds it until shutdown or loss.
///
/// `run` blocks until the lock is acquired, then signals `ready`. It
/// returns `Ok(())` after a shutdown signal (releasing the lock) and
/// `Err(LeaseError::LockLost)` if the lease is invalidated. Errors while
/// acquiring are retried after `retry_interval` on a recreated session.
pub struct Lock<S: SessionStore> {
    sessions: S,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    retry_interval: Duration,
}

impl<S: SessionStore> Lock<S> {
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

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> LeaseResult<()> {
        let key = self.key.as_str();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let session = self.sessions.create_session(self.ttl).await?;
        let mut ready = Some(ready);

        loop {
            let acquired = tokio::select! {
                res = session.acquire_lock(key, &self.value) => res,
                _ = shutdown.changed() => {
                    info!(%key, "shutdown while waiting for lock");
                    return release(&session, key).await;
                }
            };

            match acquired {
                Ok(mut lost) => {
                    info!(%key, session = %session.id(), "lock held");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }

                    tokio::select! {
                        _ = lost.lost() => {
                            error!(%key, "lock lost");
                            let _ = session.destroy().await;
                            return Err(LeaseError::LockLost);
                        }
                        _ = shutdown.changed() => {
                            info!(%key, "releasing lock on shutdown");
                            return release(&session, key).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        %key,
                        error = %e,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "failed to acquire lock"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = shutdown.changed() => return release(&session, key).await,
                    }
                    if let Err(e) = session.recreate().await {
                        warn!(%key, error = %e, "failed to recreate session");
                    }
                }
            }
        }
    }
}

/// Destroy the session on the way out. Shutdown succeeds even if the
/// release fails; the lease then lapses on its own TTL.
async fn release<T: Session>(session: &T, key: &str) -> LeaseResult<()> {
    if let Err(e) = session.destroy().await {
        warn!(%key, error = %e, "failed to release lock cleanly");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulletin_store::{KvStore, RedbStore};

    use super::*;
    use crate::session::KvSessionStore;

    fn lock(store: &RedbStore, value: &str) -> Lock<KvSessionStore<RedbStore>> {
        let sessions =
            KvSessionStore::new(store.clone()).with_poll_interval(Duration::from_millis(20));
        Lock::new(
            sessions,
            "/v1/lock/converger",
            value,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn ready_then_clean_shutdown() {
        let store = RedbStore::open_in_memory().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(lock(&store, "a").run(shutdown_rx, ready_tx));
        ready_rx.await.unwrap();
        assert_eq!(store.get("/v1/lock/converger").unwrap().value, b"a");

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert!(store.get("/v1/lock/converger").is_err());
    }

    #[tokio::test]
    async fn lost_lease_is_lock_lost() {
        let store = RedbStore::open_in_memory().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(lock(&store, "a").run(shutdown_rx, ready_tx));
        ready_rx.await.unwrap();

        store.delete(&["/v1/lock/converger"]).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(LeaseError::LockLost));
    }

    #[tokio::test]
    async fn shutdown_before_start_returns_immediately() {
        let store = RedbStore::open_in_memory().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let (ready_tx, ready_rx) = oneshot::channel();

        assert_eq!(lock(&store, "a").run(shutdown_rx, ready_tx).await, Ok(()));
        assert!(ready_rx.await.is_err());
    }
}
