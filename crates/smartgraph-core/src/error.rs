use crate::ValueKind;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SmartGraphError {
    #[error("Property '{property}' is read only")]
    ReadOnly { property: String },

    #[error("Type mismatch for property '{property}': declared {expected}, got {actual}")]
    TypeMismatch {
        property: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("Invalid rule type: {0}")]
    InvalidRuleType(String),

    #[error("Invalid rule target type: {0}")]
    InvalidTargetType(String),

    #[error("Rule target is null: {0}")]
    TargetIsNull(String),

    #[error("Rule attempted an unsupported property change: {0}")]
    TargetRulePropertyChange(String),

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SmartGraphError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration_with(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SmartGraphError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn type_mismatch_names_both_types() {
        let err = SmartGraphError::TypeMismatch {
            property: "Age".into(),
            expected: ValueKind::Int,
            actual: ValueKind::Text,
        };
        let msg = err.to_string();
        assert!(msg.contains("Age"));
        assert!(msg.contains("int"));
        assert!(msg.contains("text"));
    }

    #[test]
    fn configuration_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.toml");
        let err = SmartGraphError::configuration_with("cannot load config", io);
        assert!(err.source().is_some());
        assert!(SmartGraphError::configuration("plain").source().is_none());
    }
}
