//! Error types for the record layer.

use std::fmt;

use thiserror::Error;

/// Result type alias for record operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors produced while decoding or validating a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    MissingField { name: String },
    InvalidField { name: String },
    IllegalModification { name: String },
}

impl FieldError {
    pub fn missing(name: &str) -> Self {
        FieldError::MissingField {
            name: name.to_string(),
        }
    }

    pub fn invalid(name: &str) -> Self {
        FieldError::InvalidField {
            name: name.to_string(),
        }
    }

    pub fn illegal_modification(name: &str) -> Self {
        FieldError::IllegalModification {
            name: name.to_string(),
        }
    }

    /// The offending field name.
    pub fn field(&self) -> &str {
        match self {
            FieldError::MissingField { name }
            | FieldError::InvalidField { name }
            | FieldError::IllegalModification { name } => name,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::MissingField { name } => write!(f, "missing field '{name}'"),
            FieldError::InvalidField { name } => write!(f, "invalid field '{name}'"),
            FieldError::IllegalModification { name } => {
                write!(f, "field '{name}' cannot be modified")
            }
        }
    }
}

/// Every field that failed validation, in the order they were checked.
///
/// Built up by `validate()` implementations; an empty set converts to
/// `Ok(())` through [`ValidationErrors::into_result`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: FieldError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    /// Whether any error names the given field.
    pub fn has_field(&self, name: &str) -> bool {
        self.0.iter().any(|e| e.field() == name)
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<FieldError> for ValidationErrors {
    fn from(err: FieldError) -> Self {
        Self(vec![err])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_errors_are_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn display_joins_every_field() {
        let mut errs = ValidationErrors::new();
        errs.push(FieldError::missing("domain"));
        errs.push(FieldError::invalid("cpu_weight"));
        errs.push(FieldError::illegal_modification("stack"));

        let text = errs.to_string();
        assert_eq!(
            text,
            "missing field 'domain', invalid field 'cpu_weight', field 'stack' cannot be modified"
        );
        assert!(errs.has_field("stack"));
        assert!(!errs.has_field("instances"));
    }
}
