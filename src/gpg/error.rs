//! Error types for GPG operations
//!
//! Key lookups report "not found" through [`KeyLookup`](crate::gpg::KeyLookup);
//! the variants here are for failures the caller cannot branch around.

use std::path::PathBuf;
use std::time::Duration;

use crate::gpg::key::MalformedRecord;
use crate::gpg::version::VersionError;
use crate::io::ProcessError;

// ============================================================================
// GPG Operation Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GpgError {
    /// Launching or talking to the gpg process failed, or it exited non-zero
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Version detection failed: {0}")]
    Version(#[from] VersionError),

    #[error(transparent)]
    MalformedRecord(#[from] MalformedRecord),

    #[error("Failed to compile record pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// No installed public key carries this address
    #[error("Public key not found: {email}")]
    KeyNotFound { email: String },

    #[error("No recipients given for encryption")]
    NoRecipients,

    /// gpg produced no key records for the supplied material
    #[error("Invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    #[error("Unable to import key for {email}")]
    ImportFailed { email: String },

    /// gpg exited successfully but wrote nothing where output was required
    #[error("gpg produced no output for {operation}")]
    EmptyOutput { operation: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GpgError {
    pub fn key_not_found(email: impl Into<String>) -> Self {
        Self::KeyNotFound {
            email: email.into(),
        }
    }

    pub fn invalid_key_material(reason: impl Into<String>) -> Self {
        Self::InvalidKeyMaterial {
            reason: reason.into(),
        }
    }

    pub fn empty_output(operation: impl Into<String>) -> Self {
        Self::EmptyOutput {
            operation: operation.into(),
        }
    }

    /// Whether this error means "the input was not a usable key" rather than
    /// an environment problem
    pub fn is_rejected_key(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord(_) | Self::InvalidKeyMaterial { .. }
        )
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid chunk size: {size} - {reason}")]
    InvalidChunkSize { size: usize, reason: String },

    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Homedir validation failed: {path}")]
    HomedirValidation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Homedir is not a directory: {path}")]
    HomedirNotDirectory { path: PathBuf },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_chunk_size(size: usize, reason: impl Into<String>) -> Self {
        Self::InvalidChunkSize {
            size,
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation_helpers() {
        let error = GpgError::key_not_found("john@example.com");
        assert_eq!(error.to_string(), "Public key not found: john@example.com");

        let config_error = ConfigError::missing_field("gpg_path");
        assert!(matches!(config_error, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::invalid_chunk_size(0, "must be positive");
        let error: GpgError = config_error.into();
        assert!(matches!(error, GpgError::Config(_)));
    }

    #[test]
    fn test_rejected_key_classification() {
        assert!(GpgError::invalid_key_material("empty").is_rejected_key());
        // A failing gpg is an environment problem unless the caller says otherwise
        assert!(
            !GpgError::Process(ProcessError::Failed {
                program: "gpg".to_string(),
                code: Some(2),
                stderr: "keydb_search failed: Permission denied".to_string(),
            })
            .is_rejected_key()
        );
        assert!(
            !GpgError::Process(ProcessError::StdinNotAvailable).is_rejected_key()
        );
        assert!(!GpgError::NoRecipients.is_rejected_key());
    }
}
