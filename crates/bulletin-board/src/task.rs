//! Task state machine.
//!
//! | Op        | From                    | To        |
//! |-----------|-------------------------|-----------|
//! | desire    | (absent) / Pending      | Pending   |
//! | claim     | Pending                 | Claimed   |
//! | start     | Pending, Claimed (same cell) | Running |
//! | cancel    | Pending, Claimed, Running | Completed (failed, "cancelled") |
//! | fail      | Pending, Claimed        | Completed (failed) |
//! | complete  | Running (same cell)     | Completed |
//! | resolving | Completed               | Resolving |
//! | resolve   | Resolving               | (deleted) |

use bulletin_core::keys::{self, TASK_SCHEMA_ROOT};
use bulletin_core::{Record, Task, TaskState};
use bulletin_store::{KvStore, StoreError};
use tracing::{debug, info, instrument};

use crate::error::{BbsError, BbsResult};
use crate::{Bbs, Stored};

/// Failure reason recorded on cancelled tasks.
pub const CANCELLED_REASON: &str = "cancelled";

const RECORD: &str = "task";

impl<S: KvStore> Bbs<S> {
    // ── Lookups ───────────────────────────────────────────────────

    pub fn tasks(&self) -> BbsResult<Vec<Task>> {
        self.list(TASK_SCHEMA_ROOT)
    }

    pub fn tasks_by_domain(&self, domain: &str) -> BbsResult<Vec<Task>> {
        let mut tasks = self.tasks()?;
        tasks.retain(|t| t.domain == domain);
        Ok(tasks)
    }

    pub fn tasks_by_cell_id(&self, cell_id: &str) -> BbsResult<Vec<Task>> {
        let mut tasks = self.tasks()?;
        tasks.retain(|t| t.cell_id == cell_id);
        Ok(tasks)
    }

    pub fn task_by_guid(&self, task_guid: &str) -> BbsResult<Task> {
        Ok(self.fetch_task(task_guid)?.record)
    }

    fn fetch_task(&self, task_guid: &str) -> BbsResult<Stored<Task>> {
        self.fetch(&keys::task_key(task_guid))
    }

    // ── Transitions ───────────────────────────────────────────────

    /// Publish a new pending task.
    ///
    /// A task that already exists is overwritten only while it is still
    /// Pending; otherwise the request is rejected.
    #[instrument(skip(self, task), fields(task_guid = %task.task_guid))]
    pub async fn desire_task(&self, mut task: Task) -> BbsResult<()> {
        let now = self.now();
        task.state = TaskState::Pending;
        task.cell_id.clear();
        task.created_at = now;
        task.updated_at = now;
        task.first_completed_at = 0;
        task.validate()?;

        match self.create_record("desire task", &task).await {
            Ok(_) => {}
            Err(BbsError::Store(StoreError::KeyExists(key))) => {
                let existing: Stored<Task> = self.fetch(&key)?;
                if existing.record.state != TaskState::Pending {
                    return Err(BbsError::AlreadyExists { record: RECORD, key });
                }
                self.swap_record("desire task", existing.index, &task)
                    .await?;
                debug!("pending task overwritten");
            }
            Err(e) => return Err(e),
        }
        info!(domain = %task.domain, "task desired");
        Ok(())
    }

    /// Pending → Claimed by `cell_id`. Re-claiming by the same cell is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn claim_task(&self, task_guid: &str, cell_id: &str) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        match record.state {
            TaskState::Pending => {}
            TaskState::Claimed if record.cell_id == cell_id => return Ok(()),
            from => return Err(BbsError::transition(RECORD, &key, from, TaskState::Claimed)),
        }

        let mut task = record;
        task.state = TaskState::Claimed;
        task.cell_id = cell_id.to_string();
        task.updated_at = self.now();
        self.swap_record("claim task", index, &task).await?;
        info!("task claimed");
        Ok(())
    }

    /// Move the task to Running on `cell_id`.
    ///
    /// Returns `false` without writing when the task is already running on
    /// that cell.
    #[instrument(skip(self))]
    pub async fn start_task(&self, task_guid: &str, cell_id: &str) -> BbsResult<bool> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        match record.state {
            TaskState::Pending => {}
            TaskState::Claimed if record.cell_id == cell_id => {}
            TaskState::Running if record.cell_id == cell_id => return Ok(false),
            from => return Err(BbsError::transition(RECORD, &key, from, TaskState::Running)),
        }

        let mut task = record;
        task.state = TaskState::Running;
        task.cell_id = cell_id.to_string();
        task.updated_at = self.now();
        self.swap_record("start task", index, &task).await?;
        info!("task started");
        Ok(true)
    }

    /// Fail any non-terminal task with reason "cancelled".
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_guid: &str) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        if record.state.is_terminal() {
            return Err(BbsError::transition(
                RECORD,
                &key,
                record.state,
                TaskState::Completed,
            ));
        }

        let mut task = record;
        task.complete(true, CANCELLED_REASON, "", self.now());
        self.swap_record("cancel task", index, &task).await?;
        info!("task cancelled");
        Ok(())
    }

    /// Fail a task that never started running.
    #[instrument(skip(self))]
    pub async fn fail_task(&self, task_guid: &str, failure_reason: &str) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        if !matches!(record.state, TaskState::Pending | TaskState::Claimed) {
            return Err(BbsError::transition(
                RECORD,
                &key,
                record.state,
                TaskState::Completed,
            ));
        }

        let mut task = record;
        task.complete(true, failure_reason, "", self.now());
        self.swap_record("fail task", index, &task).await?;
        info!("task failed");
        Ok(())
    }

    /// Record the outcome reported by the cell running the task.
    #[instrument(skip(self, result))]
    pub async fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        if record.state != TaskState::Running {
            return Err(BbsError::transition(
                RECORD,
                &key,
                record.state,
                TaskState::Completed,
            ));
        }
        if record.cell_id != cell_id {
            return Err(BbsError::CellMismatch {
                task_guid: task_guid.to_string(),
                expected: cell_id.to_string(),
                actual: record.cell_id,
            });
        }

        let mut task = record;
        task.complete(failed, failure_reason, result, self.now());
        self.swap_record("complete task", index, &task).await?;
        info!(failed, "task completed");
        Ok(())
    }

    /// Completed → Resolving: a consumer is handling the outcome.
    #[instrument(skip(self))]
    pub async fn resolving_task(&self, task_guid: &str) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        if record.state != TaskState::Completed {
            return Err(BbsError::transition(
                RECORD,
                &key,
                record.state,
                TaskState::Resolving,
            ));
        }

        let mut task = record;
        task.state = TaskState::Resolving;
        task.updated_at = self.now();
        self.swap_record("resolving task", index, &task).await?;
        debug!("task resolving");
        Ok(())
    }

    /// Delete a Resolving task.
    #[instrument(skip(self))]
    pub async fn resolve_task(&self, task_guid: &str) -> BbsResult<()> {
        let Stored { key, index, record } = self.fetch_task(task_guid)?;
        if record.state != TaskState::Resolving {
            return Err(BbsError::TransitionNotAllowed {
                record: RECORD,
                key,
                from: record.state.to_string(),
                to: "Deleted".to_string(),
            });
        }

        self.delete_at("resolve task", index, &key).await?;
        info!("task resolved");
        Ok(())
    }
}
