//! Lease sessions over the KV gateway.
//!
//! A lease is a key created with a TTL. While the session holds it, a
//! renewal task rewrites the key every `ttl / 3` with
//! `compare_and_swap_by_index`, so a lease held by someone else can never
//! be refreshed by accident. A renewal that finds the key gone or moved
//! fires the lease's [`LostSignal`]. Transient store errors are tolerated
//! until one full TTL has passed without a successful renewal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bulletin_store::{KvStore, StoreError, StoreNode, Watch, WatchEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LeaseError, LeaseResult};

/// Default interval at which a blocked acquirer re-checks the lock key.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest renewal period, whatever the TTL.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

// ── Contracts ─────────────────────────────────────────────────────

/// Creates sessions with a given TTL.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    type Session: Session;

    async fn create_session(&self, ttl: Duration) -> LeaseResult<Self::Session>;
}

/// A set of leases that live and die together.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Identifier of the current incarnation.
    fn id(&self) -> String;

    /// Block until `key` is ours, then hold it.
    async fn acquire_lock(&self, key: &str, value: &[u8]) -> LeaseResult<LostSignal>;

    /// Announce `value` at `key`. Fails immediately if someone else holds it.
    async fn set_presence(&self, key: &str, value: &[u8]) -> LeaseResult<LostSignal>;

    /// Release every lease this session holds.
    async fn destroy(&self) -> LeaseResult<()>;

    /// Destroy, then start a fresh incarnation with no leases.
    async fn recreate(&self) -> LeaseResult<()>;
}

/// Fires once the lease it was handed out for is gone.
#[derive(Debug, Clone)]
pub struct LostSignal {
    rx: watch::Receiver<bool>,
}

impl LostSignal {
    /// Wait until the lease is lost.
    pub async fn lost(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

// ── KV-backed implementation ──────────────────────────────────────

/// Hands out [`KvSession`]s over a shared store.
#[derive(Debug, Clone)]
pub struct KvSessionStore<S> {
    store: S,
    poll_interval: Duration,
}

impl<S: KvStore> KvSessionStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often a blocked `acquire_lock` re-checks the key.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl<S: KvStore> SessionStore for KvSessionStore<S> {
    type Session = KvSession<S>;

    async fn create_session(&self, ttl: Duration) -> LeaseResult<KvSession<S>> {
        let session = KvSession {
            store: self.store.clone(),
            ttl,
            poll_interval: self.poll_interval,
            state: Mutex::new(SessionState::fresh()),
        };
        debug!(session = %session.id(), ttl_ms = ttl.as_millis() as u64, "session created");
        Ok(session)
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct SessionState {
    id: String,
    destroyed: bool,
    leases: Vec<HeldLease>,
}

impl SessionState {
    fn fresh() -> Self {
        Self {
            id: format!("session-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed)),
            destroyed: false,
            leases: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct HeldLease {
    key: String,
    /// Modification index of our last write to `key`.
    index: Arc<AtomicU64>,
    lost: Arc<watch::Sender<bool>>,
    renewal: JoinHandle<()>,
}

/// A session whose leases are TTL keys in a [`KvStore`].
#[derive(Debug)]
pub struct KvSession<S> {
    store: S,
    ttl: Duration,
    poll_interval: Duration,
    state: Mutex<SessionState>,
}

impl<S: KvStore> KvSession<S> {
    fn lease_node(&self, key: &str, value: &[u8]) -> StoreNode {
        StoreNode::new(key, value.to_vec()).with_ttl(self.ttl)
    }

    fn ensure_live(&self) -> LeaseResult<()> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.destroyed {
            return Err(LeaseError::SessionDestroyed(state.id.clone()));
        }
        Ok(())
    }

    /// Record a freshly created lease and start renewing it.
    fn hold(&self, written: StoreNode) -> LostSignal {
        let (lost_tx, lost_rx) = watch::channel(false);
        let lost = Arc::new(lost_tx);
        let index = Arc::new(AtomicU64::new(written.index));

        let renewal = tokio::spawn(renew(
            self.store.clone(),
            written.key.clone(),
            written.value,
            self.ttl,
            index.clone(),
            lost.clone(),
        ));

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.leases.push(HeldLease {
            key: written.key,
            index,
            lost,
            renewal,
        });
        LostSignal { rx: lost_rx }
    }

    fn release_all(&self, mark_destroyed: bool) -> Vec<HeldLease> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if mark_destroyed {
            state.destroyed = true;
        }
        std::mem::take(&mut state.leases)
    }

    /// Wake on a delete of `key` or on the poll tick, whichever is first.
    /// Expired holders produce no event until purged.
    ///
    /// A closed watch costs a full poll interval and is then replaced.
    async fn wait_for_release(&self, key: &str, watch: &mut Watch) {
        let closed = tokio::select! {
            event = watch.events.recv() => {
                if let Some(WatchEvent::Delete(node)) = &event {
                    debug!(key = %node.key, "lock key released");
                }
                event.is_none()
            }
            _ = tokio::time::sleep(self.poll_interval) => false,
        };
        if !closed {
            return;
        }

        debug!(%key, "lock watch closed, polling");
        tokio::time::sleep(self.poll_interval).await;
        match self.store.watch(key) {
            Ok(fresh) => *watch = fresh,
            Err(e) => warn!(%key, error = %e, "failed to rewatch lock key"),
        }
    }

    fn release(&self, leases: Vec<HeldLease>) -> LeaseResult<()> {
        let mut first_err = None;
        for lease in leases {
            lease.renewal.abort();
            let index = lease.index.load(Ordering::SeqCst);
            match self.store.compare_and_delete_by_index(index, &lease.key) {
                Ok(()) => debug!(key = %lease.key, "lease released"),
                Err(StoreError::KeyNotFound(_) | StoreError::IndexMismatch { .. }) => {
                    debug!(key = %lease.key, "lease already gone");
                }
                Err(e) => {
                    warn!(key = %lease.key, error = %e, "failed to release lease");
                    first_err.get_or_insert(e);
                }
            }
            lease.lost.send_replace(true);
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: KvStore> Session for KvSession<S> {
    fn id(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone()
    }

    async fn acquire_lock(&self, key: &str, value: &[u8]) -> LeaseResult<LostSignal> {
        self.ensure_live()?;
        let mut watch = self.store.watch(key)?;

        let result = loop {
            match self.store.create(self.lease_node(key, value)) {
                Ok(written) => {
                    info!(session = %self.id(), %key, "lock acquired");
                    break Ok(self.hold(written));
                }
                Err(StoreError::KeyExists(_)) => {
                    debug!(%key, "lock held elsewhere, waiting");
                }
                Err(e) if e.is_transient() => {
                    warn!(%key, error = %e, "transient error acquiring lock");
                }
                Err(e) => break Err(e.into()),
            }

            self.wait_for_release(key, &mut watch).await;
        };

        watch.cancel.cancel();
        result
    }

    async fn set_presence(&self, key: &str, value: &[u8]) -> LeaseResult<LostSignal> {
        self.ensure_live()?;
        match self.store.create(self.lease_node(key, value)) {
            Ok(written) => {
                info!(session = %self.id(), %key, "presence set");
                Ok(self.hold(written))
            }
            Err(StoreError::KeyExists(key)) => Err(LeaseError::PresenceHeld(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self) -> LeaseResult<()> {
        let leases = self.release_all(true);
        debug!(session = %self.id(), leases = leases.len(), "session destroyed");
        self.release(leases)
    }

    async fn recreate(&self) -> LeaseResult<()> {
        let leases = self.release_all(true);
        let released = self.release(leases);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = SessionState::fresh();
        debug!(session = %state.id, "session recreated");
        released
    }
}

impl<S> Drop for KvSession<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for lease in state.leases.drain(..) {
            lease.renewal.abort();
            lease.lost.send_replace(true);
        }
    }
}

/// Keep one lease alive until it is lost or the task is aborted.
async fn renew<S: KvStore>(
    store: S,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    index: Arc<AtomicU64>,
    lost: Arc<watch::Sender<bool>>,
) {
    let period = (ttl / 3).max(MIN_RENEW_PERIOD);
    let mut last_renewed = Instant::now();

    loop {
        tokio::time::sleep(period).await;

        let node = StoreNode::new(key.as_str(), value.clone()).with_ttl(ttl);
        match store.compare_and_swap_by_index(index.load(Ordering::SeqCst), node) {
            Ok(written) => {
                index.store(written.index, Ordering::SeqCst);
                last_renewed = Instant::now();
            }
            Err(e) if e.is_transient() && last_renewed.elapsed() < ttl => {
                warn!(%key, error = %e, "lease renewal failed, will retry");
            }
            Err(e) => {
                warn!(%key, error = %e, "lease lost");
                lost.send_replace(true);
                return;
            }
        }
    }
}
