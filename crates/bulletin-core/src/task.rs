//! One-shot tasks.
//!
//! ```text
//! Pending ──claim──▶ Claimed ──start──▶ Running ──complete──▶ Completed
//!    │                  │                                         │
//!    └──────start───────┴───────────────▶ Running        resolving│
//!                                                                 ▼
//!                                             (deleted) ◀──── Resolving
//! ```

use serde::{Deserialize, Serialize};

use crate::action::{Action, validate_actions};
use crate::error::{FieldError, ValidationErrors};
use crate::keys;
use crate::record::{Record, check_annotation, check_cpu_weight, require, require_guid};
use crate::state::numeric_state;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskState {
    #[default]
    Pending,
    Claimed,
    Running,
    Completed,
    Resolving,
}

numeric_state!(TaskState {
    Pending = 0,
    Claimed = 1,
    Running = 2,
    Completed = 3,
    Resolving = 4,
});

impl TaskState {
    /// Completed and Resolving tasks have an outcome and accept no new work.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Resolving)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_guid: String,
    pub domain: String,
    pub stack: String,
    #[serde(default)]
    pub root_fs: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub memory_mb: u32,
    #[serde(default)]
    pub disk_mb: u32,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub log_guid: String,
    #[serde(default)]
    pub result_file: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub first_completed_at: i64,
    #[serde(default)]
    pub state: TaskState,
    /// Assigned once a cell claims or starts the task.
    #[serde(default)]
    pub cell_id: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_callback_url: Option<String>,
    #[serde(default)]
    pub annotation: String,
}

impl Task {
    /// A pending task definition with no resource requests.
    pub fn new(task_guid: &str, domain: &str, stack: &str, actions: Vec<Action>) -> Self {
        Self {
            task_guid: task_guid.to_string(),
            domain: domain.to_string(),
            stack: stack.to_string(),
            actions,
            ..Default::default()
        }
    }

    /// Move to Completed with the given outcome.
    pub fn complete(&mut self, failed: bool, failure_reason: &str, result: &str, now: i64) {
        self.state = TaskState::Completed;
        self.failed = failed;
        self.failure_reason = failure_reason.to_string();
        self.result = result.to_string();
        if self.first_completed_at == 0 {
            self.first_completed_at = now;
        }
        self.updated_at = now;
    }
}

impl Record for Task {
    fn key(&self) -> String {
        keys::task_key(&self.task_guid)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require(&mut errs, "domain", &self.domain);
        require_guid(&mut errs, "task_guid", &self.task_guid);
        require(&mut errs, "stack", &self.stack);
        errs.extend(validate_actions(&self.actions));
        check_cpu_weight(&mut errs, self.cpu_weight);
        check_annotation(&mut errs, &self.annotation);

        match self.state {
            TaskState::Pending if !self.cell_id.is_empty() => {
                errs.push(FieldError::invalid("cell_id"));
            }
            TaskState::Claimed | TaskState::Running if self.cell_id.is_empty() => {
                errs.push(FieldError::missing("cell_id"));
            }
            _ => {}
        }

        if let Some(url) = &self.completion_callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errs.push(FieldError::invalid("completion_callback_url"));
            }
        }

        errs.into_result()
    }
}
