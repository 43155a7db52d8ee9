//! Task convergence.
//!
//! | State     | Condition                                  | Action                      |
//! |-----------|--------------------------------------------|-----------------------------|
//! | Pending   | older than `time_to_claim`                 | fail "not claimed within time limit" |
//! | Pending   | untouched for `convergence_interval`       | republish                   |
//! | Claimed   | cell gone                                  | fail "cell disappeared"     |
//! | Claimed   | untouched for `convergence_interval`       | back to Pending             |
//! | Running   | cell gone                                  | fail "cell disappeared"     |
//! | Completed | completed longer than `expire_completed_duration` ago | delete           |
//! | Completed | untouched for `convergence_interval`       | republish                   |
//! | Resolving | untouched for `time_to_resolve`            | back to Completed           |

use bulletin_core::keys::TASK_SCHEMA_ROOT;
use bulletin_core::{Task, TaskState};
use bulletin_store::KvStore;
use tracing::{info, instrument};

use crate::batch::{Batch, Effect};
use crate::cell_client::CellClient;
use crate::error::ConvergeResult;
use crate::stats::ConvergeStats;
use crate::{Converger, encode, older_than};

pub const NOT_CLAIMED_REASON: &str = "not claimed within time limit";
pub const CELL_DISAPPEARED_REASON: &str = "cell disappeared";

impl<S: KvStore, C: CellClient> Converger<S, C> {
    /// One task pass over a snapshot of every task and cell.
    #[instrument(skip(self))]
    pub async fn converge_tasks(&self) -> ConvergeResult<ConvergeStats> {
        let scan = self.bbs.scan::<Task>(TASK_SCHEMA_ROOT)?;
        let cells = self.bbs.live_cells()?;
        let now = self.now();
        let cfg = &self.config;

        let mut batch = Batch::default();
        for node in &scan.malformed {
            batch.delete(node.index, node.key.as_str(), Effect::MalformedDeleted);
        }

        for stored in scan.records {
            let mut task = stored.record;
            let effect = match task.state {
                TaskState::Pending if older_than(now, task.created_at, cfg.time_to_claim) => {
                    task.complete(true, NOT_CLAIMED_REASON, "", now);
                    Effect::TaskFailed
                }
                TaskState::Claimed | TaskState::Running if !cells.contains_key(&task.cell_id) => {
                    task.complete(true, CELL_DISAPPEARED_REASON, "", now);
                    Effect::TaskFailed
                }
                TaskState::Claimed if older_than(now, task.updated_at, cfg.convergence_interval) => {
                    task.state = TaskState::Pending;
                    task.cell_id.clear();
                    task.updated_at = now;
                    Effect::TaskDemoted
                }
                TaskState::Completed
                    if older_than(now, task.first_completed_at, cfg.expire_completed_duration) =>
                {
                    batch.delete(stored.index, stored.key, Effect::TaskExpired);
                    continue;
                }
                TaskState::Pending | TaskState::Completed
                    if older_than(now, task.updated_at, cfg.convergence_interval) =>
                {
                    task.updated_at = now;
                    Effect::TaskKicked
                }
                TaskState::Resolving if older_than(now, task.updated_at, cfg.time_to_resolve) => {
                    task.state = TaskState::Completed;
                    task.updated_at = now;
                    Effect::TaskDemoted
                }
                _ => continue,
            };
            if let Some(node) = encode(&stored.key, &task) {
                batch.swap(stored.index, node, effect);
            }
        }

        let mut stats = ConvergeStats::default();
        if !batch.is_empty() {
            batch.apply(self.bbs.store(), &mut stats).await;
        }
        if stats.writes() > 0 {
            info!(
                tasks_failed = stats.tasks_failed,
                tasks_kicked = stats.tasks_kicked,
                tasks_demoted = stats.tasks_demoted,
                tasks_expired = stats.tasks_expired,
                malformed_deleted = stats.malformed_deleted,
                conflicts = stats.conflicts,
                "tasks converged"
            );
        }
        Ok(stats)
    }
}
