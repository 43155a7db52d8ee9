//! Container actions carried by tasks and desired LRPs.
//!
//! Wire shape is an array of externally tagged objects:
//!
//! ```json
//! [{"download": {"from": "http://blob/app.tgz", "to": "/app"}},
//!  {"run": {"path": "/app/start", "args": ["--port", "8080"]}}]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FieldError, ValidationErrors};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Run(RunAction),
    Download(DownloadAction),
    Upload(UploadAction),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAction {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAction {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub cache_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAction {
    pub from: String,
    pub to: String,
}

impl Action {
    /// Shorthand for a run action with arguments and no environment.
    pub fn run(path: &str, args: &[&str]) -> Self {
        Action::Run(RunAction {
            path: path.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
        })
    }

    /// Check required fields, reporting them under `actions`.
    pub fn validate(&self) -> ValidationErrors {
        let mut errs = ValidationErrors::new();
        match self {
            Action::Run(run) => {
                if run.path.is_empty() {
                    errs.push(FieldError::missing("actions.run.path"));
                }
            }
            Action::Download(dl) => {
                if dl.from.is_empty() {
                    errs.push(FieldError::missing("actions.download.from"));
                }
                if dl.to.is_empty() {
                    errs.push(FieldError::missing("actions.download.to"));
                }
            }
            Action::Upload(up) => {
                if up.from.is_empty() {
                    errs.push(FieldError::missing("actions.upload.from"));
                }
                if up.to.is_empty() {
                    errs.push(FieldError::missing("actions.upload.to"));
                }
            }
        }
        errs
    }
}

/// Validate an action list: at least one action, each well-formed.
pub(crate) fn validate_actions(actions: &[Action]) -> ValidationErrors {
    let mut errs = ValidationErrors::new();
    if actions.is_empty() {
        errs.push(FieldError::missing("actions"));
    }
    for action in actions {
        errs.extend(action.validate());
    }
    errs
}
