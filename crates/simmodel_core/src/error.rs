//! Error types shared by the loader, the resolution pass and the ODE assembly layer.
//!
//! Every error carries the component that raised it and a message naming the
//! offending object, so a failed model construction can be reported verbatim.

use thiserror::Error;

/// Errors raised while turning an XML model into an executable ODE system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// Unexpected tag, missing child element or malformed attribute.
    #[error("{source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },
    /// Unknown quantity/formula id or a quantity of the wrong kind.
    #[error("{source_name}: {message}")]
    Resolution {
        source_name: String,
        message: String,
    },
    /// Invalid model configuration (non-positive scale factor, broken index map, ...).
    #[error("{source_name}: {message}")]
    Configuration {
        source_name: String,
        message: String,
    },
}

impl ModelError {
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn resolution(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn configuration(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Component label the error was raised from.
    pub fn source_name(&self) -> &str {
        match self {
            Self::Parse { source_name, .. }
            | Self::Resolution { source_name, .. }
            | Self::Configuration { source_name, .. } => source_name,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Parse { message, .. }
            | Self::Resolution { message, .. }
            | Self::Configuration { message, .. } => message,
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_component_label() {
        let err = ModelError::resolution("QuantityReference::finalize", "object with id=7 not found");
        assert_eq!(
            err.to_string(),
            "QuantityReference::finalize: object with id=7 not found"
        );
        assert_eq!(err.source_name(), "QuantityReference::finalize");
        assert_eq!(err.message(), "object with id=7 not found");
    }

    #[test]
    fn kinds_are_distinguishable() {
        let parse = ModelError::parse("a", "b");
        let config = ModelError::configuration("a", "b");
        assert!(matches!(parse, ModelError::Parse { .. }));
        assert!(matches!(config, ModelError::Configuration { .. }));
        assert_ne!(parse, config);
    }
}
