use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// The variants follow how far an operation got before failing: usage and
/// validation errors happen before anything is touched, precondition errors
/// refuse to touch a busy resource, and the remaining ones happen while
/// talking to resources or reading their data.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed command-line input
    #[error("{0}")]
    Usage(String),

    /// A property value was rejected while preparing a batch
    #[error("{}", qualified(.property, .message))]
    Validation { property: String, message: String },

    /// A busy resource must be stopped by the user first
    #[error("{0}")]
    Precondition(String),

    /// Some already validated properties failed to apply
    #[error("{0}")]
    PartialApply(String),

    /// A remote operation failed
    #[error("{0}")]
    Transport(String),

    /// Persisted or remote data violates its structural invariants
    #[error("corrupted data: {0}")]
    Corruption(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a validation error for `property`
    pub fn validation(property: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            property: property.into(),
            message: message.into(),
        }
    }

    /// Returns true if the user invoked the tool incorrectly
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// Returns true if nothing was mutated because of this error
    pub fn is_before_mutation(&self) -> bool {
        matches!(
            self,
            Error::Usage(_) | Error::Validation { .. } | Error::Precondition(_)
        )
    }

    /// Returns true if the error only invalidates the load or refresh that
    /// produced it, leaving the process usable
    pub fn is_fatal_to_load(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::Json(_))
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        if self.is_usage() { 2 } else { 1 }
    }
}

/// Cross-property failures carry no property name
fn qualified(property: &str, message: &str) -> String {
    if property.is_empty() {
        message.to_string()
    } else {
        format!("{property}: {message}")
    }
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let usage = Error::Usage("Assignment expected: \"foo\"".into());
        assert!(usage.is_usage());
        assert!(usage.is_before_mutation());
        assert_eq!(usage.exit_code(), 2);

        let validation = Error::validation("ssh.port", "Privileged ports may not be used");
        assert!(validation.is_before_mutation());
        assert_eq!(
            validation.to_string(),
            "ssh.port: Privileged ports may not be used"
        );
        assert_eq!(validation.exit_code(), 1);

        let cross = Error::validation("", "Value too big");
        assert_eq!(cross.to_string(), "Value too big");

        let partial = Error::PartialApply("Failed to set some of the properties".into());
        assert!(!partial.is_before_mutation());
        assert!(!partial.is_fatal_to_load());

        let corrupt = Error::Corruption("missing key BuildEngine.1".into());
        assert!(corrupt.is_fatal_to_load());
    }
}
