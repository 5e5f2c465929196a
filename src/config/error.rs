use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigurationError>;

/// Failures while loading or validating agent configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Configuration file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration from {source_name}: {message}")]
    ParseError { source_name: String, message: String },

    #[error("Missing required field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    #[error("Invalid value '{value}' for '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    pub fn config_file_not_found(path: impl Into<String>) -> Self {
        Self::ConfigFileNotFound { path: path.into() }
    }

    pub fn parse_error(source_name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::ParseError {
            source_name: source_name.into(),
            message: error.to_string(),
        }
    }

    pub fn missing_required_field(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }
}
