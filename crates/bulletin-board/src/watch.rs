//! Decoded change streams over the raw store watch.
//!
//! Each watch spawns a forwarding task on the current tokio runtime. The
//! returned [`RecordWatch`] keeps the store's events / cancel / errors
//! shape: a store failure arrives on `errors` and ends the stream,
//! cancelling closes `events`. Records that fail to decode are logged and
//! skipped.

use bulletin_core::keys::{ACTUAL_LRP_SCHEMA_ROOT, DESIRED_LRP_SCHEMA_ROOT, TASK_SCHEMA_ROOT};
use bulletin_core::{ActualLrp, DesiredLrp, ModelResult, Record, Task, TaskState};
use bulletin_store::{KvStore, StoreNode, Watch, WatchCancel, WatchEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::Bbs;
use crate::actual::is_evacuating_key;
use crate::error::{BbsError, BbsResult};

const EVENT_BUFFER: usize = 256;

/// A stream of decoded records.
#[derive(Debug)]
pub struct RecordWatch<T> {
    pub events: mpsc::Receiver<T>,
    pub errors: mpsc::Receiver<BbsError>,
    pub cancel: WatchCancel,
}

/// One change to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange<R> {
    Created(R),
    Changed { before: R, after: R },
    Removed(R),
}

/// A change to an instance record or to its evacuating copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualLrpChange {
    pub change: RecordChange<ActualLrp>,
    pub evacuating: bool,
}

impl<S: KvStore> Bbs<S> {
    /// Tasks as they reach Completed.
    pub fn watch_for_completed_task(&self) -> BbsResult<RecordWatch<Task>> {
        let watch = self.store.watch(TASK_SCHEMA_ROOT)?;
        Ok(forward(watch, "completed task", |event| {
            let node = match event {
                WatchEvent::Create(node) | WatchEvent::Update { node, .. } => node,
                WatchEvent::Delete(_) => return None,
            };
            let task = decode::<Task>(&node)?;
            (task.state == TaskState::Completed).then_some(task)
        }))
    }

    pub fn watch_for_desired_lrp_changes(
        &self,
    ) -> BbsResult<RecordWatch<RecordChange<DesiredLrp>>> {
        let watch = self.store.watch(DESIRED_LRP_SCHEMA_ROOT)?;
        Ok(forward(watch, "desired lrp", |event| record_change(&event)))
    }

    /// Instance changes, including evacuating copies.
    pub fn watch_for_actual_lrp_changes(&self) -> BbsResult<RecordWatch<ActualLrpChange>> {
        let watch = self.store.watch(ACTUAL_LRP_SCHEMA_ROOT)?;
        Ok(forward(watch, "actual lrp", |event| {
            Some(ActualLrpChange {
                evacuating: is_evacuating_key(event.key()),
                change: record_change(&event)?,
            })
        }))
    }
}

fn record_change<R: Record>(event: &WatchEvent) -> Option<RecordChange<R>> {
    Some(match event {
        WatchEvent::Create(node) => RecordChange::Created(decode(node)?),
        WatchEvent::Update { prev, node } => RecordChange::Changed {
            before: decode(prev)?,
            after: decode(node)?,
        },
        WatchEvent::Delete(node) => RecordChange::Removed(decode(node)?),
    })
}

fn decode<R: Record>(node: &StoreNode) -> Option<R> {
    let decoded: ModelResult<R> = R::from_json(&node.value);
    match decoded {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(key = %node.key, error = %e, "skipping undecodable watch event");
            None
        }
    }
}

fn forward<T, F>(watch: Watch, what: &'static str, mut map: F) -> RecordWatch<T>
where
    T: Send + 'static,
    F: FnMut(WatchEvent) -> Option<T> + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (error_tx, error_rx) = mpsc::channel(1);
    let Watch {
        mut events,
        mut errors,
        cancel,
    } = watch;
    let upstream = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(e) = errors.recv() => {
                    warn!(watch = what, error = %e, "watch failed");
                    let _ = error_tx.send(e.into()).await;
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        if let Ok(e) = errors.try_recv() {
                            let _ = error_tx.send(e.into()).await;
                        }
                        break;
                    };
                    if let Some(item) = map(event) {
                        if event_tx.send(item).await.is_err() {
                            upstream.cancel();
                            break;
                        }
                    }
                }
            }
        }
        debug!(watch = what, "watch forwarder stopped");
    });

    RecordWatch {
        events: event_rx,
        errors: error_rx,
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulletin_core::action::Action;
    use bulletin_core::{ActualLrpContainerKey, ActualLrpKey, ActualLrpNetInfo};
    use tokio::time::timeout;

    use super::*;
    use crate::testing::bbs;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn completed_stream_sees_only_completions() {
        let (bbs, _) = bbs();
        let mut watch = bbs.watch_for_completed_task().unwrap();

        bbs.desire_task(Task::new("t1", "d", "s", vec![Action::run("ls", &[])]))
            .await
            .unwrap();
        bbs.start_task("t1", "cellA").await.unwrap();
        bbs.complete_task("t1", "cellA", false, "", "ok")
            .await
            .unwrap();
        bbs.resolving_task("t1").await.unwrap();

        let task = timeout(WAIT, watch.events.recv()).await.unwrap().unwrap();
        assert_eq!(task.task_guid, "t1");
        assert!(!task.failed);
        assert_eq!(task.result, "ok");

        watch.cancel.cancel();
        assert_eq!(timeout(WAIT, watch.events.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn desired_changes_are_decoded() {
        let (bbs, _) = bbs();
        let mut watch = bbs.watch_for_desired_lrp_changes().unwrap();

        let lrp = DesiredLrp::new("p", "d", "s", 1);
        bbs.desire_lrp(&lrp).await.unwrap();
        let mut scaled = lrp.clone();
        scaled.instances = 2;
        bbs.update_desired_lrp(&scaled).await.unwrap();
        bbs.remove_desired_lrp_by_process_guid("p").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(timeout(WAIT, watch.events.recv()).await.unwrap().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                RecordChange::Created(lrp.clone()),
                RecordChange::Changed {
                    before: lrp,
                    after: scaled.clone(),
                },
                RecordChange::Removed(scaled),
            ]
        );
    }

    #[tokio::test]
    async fn actual_changes_flag_evacuating() {
        let (bbs, _) = bbs();
        let mut watch = bbs.watch_for_actual_lrp_changes().unwrap();

        let key = ActualLrpKey::new("p", 0, "d");
        let ck = ActualLrpContainerKey::new("ig", "cellA");
        let net = ActualLrpNetInfo::new("10.0.0.1", vec![]);
        bbs.start_actual_lrp(&key, &ck, &net).await.unwrap();
        bbs.evacuate_running_actual_lrp(&key, &ck, &net, Duration::from_secs(30))
            .await
            .unwrap();

        let first = timeout(WAIT, watch.events.recv()).await.unwrap().unwrap();
        assert!(!first.evacuating);
        assert!(matches!(first.change, RecordChange::Created(_)));

        let second = timeout(WAIT, watch.events.recv()).await.unwrap().unwrap();
        assert!(second.evacuating);
        assert!(matches!(second.change, RecordChange::Created(_)));

        let third = timeout(WAIT, watch.events.recv()).await.unwrap().unwrap();
        assert!(!third.evacuating);
        assert!(matches!(third.change, RecordChange::Changed { .. }));
    }
}
