use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootError {
    /// The topology descriptor is inconsistent or incomplete.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, BootError>;

impl BootError {
    /// Shorthand for building a [`BootError::ConfigurationError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// Returns true if this error was raised while validating a descriptor.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationError(_))
    }
}

impl From<std::io::Error> for BootError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BootError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = BootError::config("shard 'shard3' references unknown replica set 'rs3'");
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "Configuration error: shard 'shard3' references unknown replica set 'rs3'"
        );
    }

    #[test]
    fn test_json_error_becomes_parse_error() {
        let err: BootError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, BootError::ParseError(_)));
        assert!(!err.is_configuration());
    }
}
