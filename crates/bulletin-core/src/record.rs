//! The `Record` trait shared by every stored object.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{FieldError, ModelError, ModelResult, ValidationErrors};

/// Maximum annotation size accepted on tasks and desired LRPs.
pub const MAX_ANNOTATION_BYTES: usize = 10 * 1024;

/// Upper bound on `cpu_weight`.
pub const MAX_CPU_WEIGHT: u32 = 100;

static GUID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static guid pattern"));

/// Whether a task or process guid uses only the allowed characters.
pub fn is_valid_guid(guid: &str) -> bool {
    GUID_PATTERN.is_match(guid)
}

/// A JSON record stored at a derived key.
pub trait Record: Serialize + DeserializeOwned {
    /// Key path this record lives at.
    fn key(&self) -> String;

    /// Every invalid field, or `Ok(())`.
    fn validate(&self) -> Result<(), ValidationErrors>;

    /// Canonical JSON bytes.
    fn to_json(&self) -> ModelResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ModelError::MalformedPayload(e.to_string()))
    }

    /// Decode and validate.
    fn from_json(bytes: &[u8]) -> ModelResult<Self> {
        let record: Self = serde_json::from_slice(bytes)
            .map_err(|e| ModelError::MalformedPayload(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }
}

pub(crate) fn require(errs: &mut ValidationErrors, name: &str, value: &str) {
    if value.is_empty() {
        errs.push(FieldError::missing(name));
    }
}

pub(crate) fn require_guid(errs: &mut ValidationErrors, name: &str, value: &str) {
    if value.is_empty() {
        errs.push(FieldError::missing(name));
    } else if !is_valid_guid(value) {
        errs.push(FieldError::invalid(name));
    }
}

pub(crate) fn check_cpu_weight(errs: &mut ValidationErrors, cpu_weight: u32) {
    if cpu_weight > MAX_CPU_WEIGHT {
        errs.push(FieldError::invalid("cpu_weight"));
    }
}

pub(crate) fn check_annotation(errs: &mut ValidationErrors, annotation: &str) {
    if annotation.len() > MAX_ANNOTATION_BYTES {
        errs.push(FieldError::invalid("annotation"));
    }
}
