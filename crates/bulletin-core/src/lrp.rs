//! Long-running processes: the desired fleet and its observed instances.

use serde::{Deserialize, Serialize};

use crate::action::{Action, validate_actions};
use crate::error::{FieldError, ValidationErrors};
use crate::keys;
use crate::record::{Record, check_annotation, check_cpu_weight, require, require_guid};
use crate::state::numeric_state;

// ── DesiredLRP ────────────────────────────────────────────────────

/// A declared fleet of identical instances.
///
/// Only `instances`, `routes`, and `annotation` may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub domain: String,
    pub stack: String,
    #[serde(default)]
    pub root_fs: String,
    pub instances: u32,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub memory_mb: u32,
    #[serde(default)]
    pub disk_mb: u32,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub log_guid: String,
    #[serde(default)]
    pub annotation: String,
}

/// The mutable subset of a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl DesiredLrp {
    pub fn new(process_guid: &str, domain: &str, stack: &str, instances: u32) -> Self {
        Self {
            process_guid: process_guid.to_string(),
            domain: domain.to_string(),
            stack: stack.to_string(),
            instances,
            actions: vec![Action::run("/app/start", &[])],
            ..Default::default()
        }
    }

    /// Reject `updated` if it changes anything but the mutable fields.
    ///
    /// The updated record must also be valid on its own.
    pub fn validate_modifications(&self, updated: &DesiredLrp) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();

        macro_rules! immutable {
            ($($field:ident),+) => {
                $(
                    if self.$field != updated.$field {
                        errs.push(FieldError::illegal_modification(stringify!($field)));
                    }
                )+
            };
        }
        immutable!(
            process_guid,
            domain,
            stack,
            root_fs,
            actions,
            memory_mb,
            disk_mb,
            cpu_weight,
            ports,
            log_guid
        );

        if let Err(invalid) = updated.validate() {
            errs.extend(invalid);
        }
        errs.into_result()
    }

    /// Apply an update, producing the record to persist.
    pub fn apply(&self, update: &DesiredLrpUpdate) -> DesiredLrp {
        let mut next = self.clone();
        if let Some(instances) = update.instances {
            next.instances = instances;
        }
        if let Some(routes) = &update.routes {
            next.routes = routes.clone();
        }
        if let Some(annotation) = &update.annotation {
            next.annotation = annotation.clone();
        }
        next
    }
}

impl Record for DesiredLrp {
    fn key(&self) -> String {
        keys::desired_lrp_key(&self.process_guid)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        require(&mut errs, "domain", &self.domain);
        require_guid(&mut errs, "process_guid", &self.process_guid);
        require(&mut errs, "stack", &self.stack);
        if self.instances < 1 {
            errs.push(FieldError::invalid("instances"));
        }
        errs.extend(validate_actions(&self.actions));
        check_cpu_weight(&mut errs, self.cpu_weight);
        check_annotation(&mut errs, &self.annotation);
        errs.into_result()
    }
}

// ── ActualLRP ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ActualLrpState {
    #[default]
    Unclaimed,
    Claimed,
    Running,
}

numeric_state!(ActualLrpState {
    Unclaimed = 0,
    Claimed = 1,
    Running = 2,
});

/// Which instance slot of which process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpKey {
    pub process_guid: String,
    pub index: i32,
    pub domain: String,
}

impl ActualLrpKey {
    pub fn new(process_guid: &str, index: i32, domain: &str) -> Self {
        Self {
            process_guid: process_guid.to_string(),
            index,
            domain: domain.to_string(),
        }
    }

    fn validate(&self, errs: &mut ValidationErrors) {
        require_guid(errs, "process_guid", &self.process_guid);
        if self.index < 0 {
            errs.push(FieldError::invalid("index"));
        }
        require(errs, "domain", &self.domain);
    }
}

/// Which container on which cell holds the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpContainerKey {
    #[serde(default)]
    pub instance_guid: String,
    #[serde(default)]
    pub cell_id: String,
}

impl ActualLrpContainerKey {
    pub fn new(instance_guid: &str, cell_id: &str) -> Self {
        Self {
            instance_guid: instance_guid.to_string(),
            cell_id: cell_id.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance_guid.is_empty() && self.cell_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Where a running instance can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpNetInfo {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    pub fn new(address: &str, ports: Vec<PortMapping>) -> Self {
        Self {
            address: address.to_string(),
            ports,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.ports.is_empty()
    }
}

/// One observed instance of a desired LRP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrp {
    #[serde(flatten)]
    pub key: ActualLrpKey,
    #[serde(flatten)]
    pub container_key: ActualLrpContainerKey,
    #[serde(flatten)]
    pub net_info: ActualLrpNetInfo,
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default)]
    pub state: ActualLrpState,
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub placement_error: String,
}

impl ActualLrp {
    /// A fresh unclaimed slot.
    pub fn unclaimed(key: ActualLrpKey, since: i64) -> Self {
        Self {
            key,
            since,
            ..Default::default()
        }
    }

    /// Whether moving to `new_state` as `container_key` is permitted.
    ///
    /// The LRP key must match, and unless this record is Unclaimed the
    /// caller's container key must be the one currently holding it.
    pub fn allows_transition_to(
        &self,
        key: &ActualLrpKey,
        container_key: &ActualLrpContainerKey,
        new_state: ActualLrpState,
    ) -> bool {
        use ActualLrpState::*;

        if self.key != *key {
            return false;
        }
        if self.state != Unclaimed && self.container_key != *container_key {
            return false;
        }
        matches!(
            (self.state, new_state),
            (Unclaimed, Unclaimed)
                | (Unclaimed, Claimed)
                | (Unclaimed, Running)
                | (Claimed, Unclaimed)
                | (Claimed, Claimed)
                | (Claimed, Running)
                | (Running, Unclaimed)
                | (Running, Claimed)
                | (Running, Running)
        )
    }

    /// Drop the container and network identity, back to Unclaimed.
    pub fn demote_to_unclaimed(&mut self, now: i64) {
        self.state = ActualLrpState::Unclaimed;
        self.container_key = ActualLrpContainerKey::default();
        self.net_info = ActualLrpNetInfo::default();
        self.since = now;
    }

    /// The stop request a cell needs to tear this instance down.
    pub fn stop_request(&self) -> StopLrpInstance {
        StopLrpInstance {
            process_guid: self.key.process_guid.clone(),
            instance_guid: self.container_key.instance_guid.clone(),
            index: self.key.index,
            cell_id: self.container_key.cell_id.clone(),
        }
    }
}

impl Record for ActualLrp {
    fn key(&self) -> String {
        keys::actual_lrp_key(&self.key.process_guid, self.key.index)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        self.key.validate(&mut errs);

        match self.state {
            ActualLrpState::Unclaimed => {
                if !self.container_key.instance_guid.is_empty() {
                    errs.push(FieldError::invalid("instance_guid"));
                }
                if !self.container_key.cell_id.is_empty() {
                    errs.push(FieldError::invalid("cell_id"));
                }
            }
            ActualLrpState::Claimed | ActualLrpState::Running => {
                require(&mut errs, "instance_guid", &self.container_key.instance_guid);
                require(&mut errs, "cell_id", &self.container_key.cell_id);
            }
        }

        errs.into_result()
    }
}

// ── Stop request ──────────────────────────────────────────────────

/// Body POSTed to a cell to stop one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLrpInstance {
    pub process_guid: String,
    pub instance_guid: String,
    pub index: i32,
    pub cell_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelError;

    fn claimed(cell: &str) -> ActualLrp {
        ActualLrp {
            key: ActualLrpKey::new("p", 0, "d"),
            container_key: ActualLrpContainerKey::new("ig-1", cell),
            state: ActualLrpState::Claimed,
            since: 10,
            ..Default::default()
        }
    }

    // ── DesiredLRP validation ─────────────────────────────────────

    #[test]
    fn desired_instances_boundary() {
        let mut lrp = DesiredLrp::new("p", "d", "s", 1);
        assert!(lrp.validate().is_ok());

        lrp.instances = 0;
        assert!(lrp.validate().unwrap_err().has_field("instances"));
    }

    #[test]
    fn desired_cpu_weight_boundary() {
        let mut lrp = DesiredLrp::new("p", "d", "s", 1);
        lrp.cpu_weight = 100;
        assert!(lrp.validate().is_ok());
        lrp.cpu_weight = 101;
        assert!(lrp.validate().unwrap_err().has_field("cpu_weight"));
    }

    #[test]
    fn desired_process_guid_charset() {
        for good in ["A_z-0", "abc"] {
            assert!(DesiredLrp::new(good, "d", "s", 1).validate().is_ok(), "{good}");
        }
        for bad in ["a.b", "a/b", ""] {
            let errs = DesiredLrp::new(bad, "d", "s", 1).validate().unwrap_err();
            assert!(errs.has_field("process_guid"), "{bad}");
        }
    }

    #[test]
    fn mutable_fields_may_change() {
        let before = DesiredLrp::new("p", "d", "s", 1);
        let after = before.apply(&DesiredLrpUpdate {
            instances: Some(5),
            routes: Some(vec!["app.example.com".to_string()]),
            annotation: Some("v2".to_string()),
        });
        assert!(before.validate_modifications(&after).is_ok());
        assert_eq!(after.instances, 5);
    }

    #[test]
    fn immutable_field_change_is_named() {
        let before = DesiredLrp::new("p", "d", "s", 1);
        let mut after = before.clone();
        after.stack = "t".to_string();
        after.instances = 5;

        let errs = before.validate_modifications(&after).unwrap_err();
        assert_eq!(errs.errors(), &[FieldError::illegal_modification("stack")]);
    }

    #[test]
    fn modification_to_invalid_record_is_rejected() {
        let before = DesiredLrp::new("p", "d", "s", 1);
        let mut after = before.clone();
        after.instances = 0;
        assert!(before.validate_modifications(&after).unwrap_err().has_field("instances"));
    }

    // ── ActualLRP validation ──────────────────────────────────────

    #[test]
    fn unclaimed_must_not_carry_container() {
        let mut lrp = ActualLrp::unclaimed(ActualLrpKey::new("p", 0, "d"), 1);
        assert!(lrp.validate().is_ok());

        lrp.container_key.cell_id = "cellA".to_string();
        assert!(lrp.validate().unwrap_err().has_field("cell_id"));
    }

    #[test]
    fn claimed_must_carry_container() {
        let mut lrp = claimed("cellA");
        assert!(lrp.validate().is_ok());

        lrp.container_key.instance_guid.clear();
        assert!(lrp.validate().unwrap_err().has_field("instance_guid"));
    }

    #[test]
    fn negative_index_is_invalid() {
        let lrp = ActualLrp::unclaimed(ActualLrpKey::new("p", -1, "d"), 1);
        assert!(lrp.validate().unwrap_err().has_field("index"));
    }

    #[test]
    fn actual_wire_shape_is_flat() {
        let mut lrp = claimed("cellA");
        lrp.state = ActualLrpState::Running;
        lrp.net_info = ActualLrpNetInfo::new(
            "10.0.0.1",
            vec![PortMapping {
                container_port: 8080,
                host_port: 61000,
            }],
        );
        let json: serde_json::Value = serde_json::from_slice(&lrp.to_json().unwrap()).unwrap();
        assert_eq!(json["process_guid"], "p");
        assert_eq!(json["cell_id"], "cellA");
        assert_eq!(json["address"], "10.0.0.1");
        assert_eq!(json["state"], 2);

        assert_eq!(ActualLrp::from_json(&lrp.to_json().unwrap()).unwrap(), lrp);
    }

    #[test]
    fn actual_from_invalid_json_reports_validation() {
        let err = ActualLrp::from_json(br#"{"process_guid":"p","index":0,"domain":"d","state":1}"#)
            .unwrap_err();
        assert!(matches!(err, ModelError::Invalid(_)));
    }

    // ── Transitions ───────────────────────────────────────────────

    #[test]
    fn unclaimed_may_move_anywhere_with_any_container() {
        let lrp = ActualLrp::unclaimed(ActualLrpKey::new("p", 0, "d"), 1);
        let ck = ActualLrpContainerKey::new("ig", "cellA");
        for state in [
            ActualLrpState::Unclaimed,
            ActualLrpState::Claimed,
            ActualLrpState::Running,
        ] {
            assert!(lrp.allows_transition_to(&lrp.key, &ck, state));
        }
    }

    #[test]
    fn claimed_requires_same_container() {
        let lrp = claimed("cellA");
        let mine = lrp.container_key.clone();
        let theirs = ActualLrpContainerKey::new("ig-2", "cellB");

        assert!(lrp.allows_transition_to(&lrp.key, &mine, ActualLrpState::Running));
        assert!(lrp.allows_transition_to(&lrp.key, &mine, ActualLrpState::Claimed));
        assert!(lrp.allows_transition_to(&lrp.key, &mine, ActualLrpState::Unclaimed));
        assert!(!lrp.allows_transition_to(&lrp.key, &theirs, ActualLrpState::Running));
        assert!(!lrp.allows_transition_to(&lrp.key, &theirs, ActualLrpState::Claimed));
    }

    #[test]
    fn mismatched_lrp_key_is_rejected() {
        let lrp = claimed("cellA");
        let other_key = ActualLrpKey::new("p", 1, "d");
        assert!(!lrp.allows_transition_to(
            &other_key,
            &lrp.container_key,
            ActualLrpState::Running
        ));
    }

    #[test]
    fn demote_clears_identity() {
        let mut lrp = claimed("cellA");
        lrp.net_info = ActualLrpNetInfo::new("10.0.0.1", vec![]);
        lrp.demote_to_unclaimed(99);
        assert_eq!(lrp.state, ActualLrpState::Unclaimed);
        assert!(lrp.container_key.is_empty());
        assert!(lrp.net_info.is_empty());
        assert_eq!(lrp.since, 99);
        assert!(lrp.validate().is_ok());
    }

    #[test]
    fn round_trip_preserves_every_field() {
        use crate::action::{DownloadAction, EnvironmentVariable, RunAction, UploadAction};

        let desired = DesiredLrp {
            process_guid: "p".to_string(),
            domain: "d".to_string(),
            stack: "s".to_string(),
            root_fs: "docker:///busybox".to_string(),
            instances: 3,
            actions: vec![
                Action::Download(DownloadAction {
                    from: "http://blob/app.tgz".to_string(),
                    to: "/app".to_string(),
                    cache_key: "app-v1".to_string(),
                }),
                Action::Run(RunAction {
                    path: "/app/start".to_string(),
                    args: vec!["--port".to_string(), "8080".to_string()],
                    env: vec![EnvironmentVariable {
                        name: "PORT".to_string(),
                        value: "8080".to_string(),
                    }],
                }),
                Action::Upload(UploadAction {
                    from: "/app/logs".to_string(),
                    to: "http://blob/logs".to_string(),
                }),
            ],
            memory_mb: 256,
            disk_mb: 1024,
            cpu_weight: 50,
            ports: vec![8080, 9090],
            routes: vec!["app.example.com".to_string(), "www.example.com".to_string()],
            log_guid: "log-1".to_string(),
            annotation: "v42".to_string(),
        };
        assert!(desired.validate().is_ok());

        let bytes = desired.to_json().unwrap();
        assert_eq!(DesiredLrp::from_json(&bytes).unwrap(), desired);
        assert_eq!(desired.to_json().unwrap(), bytes);
    }
}
