//! Error types for the Dynatrace operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for DynaKube specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Certificate handling error (secret shape, expiry, file sync)
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Code-module installer error
    #[error("installer error: {0}")]
    Installer(String),

    /// Support-archive collection error
    #[error("support archive error: {0}")]
    SupportArchive(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Required configuration is missing or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error with the offending path
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the operation failed on
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create an installer error with the given message
    pub fn installer(msg: impl Into<String>) -> Self {
        Self::Installer(msg.into())
    }

    /// Create a support-archive error with the given message
    pub fn support_archive(msg: impl Into<String>) -> Self {
        Self::SupportArchive(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an I/O error bound to a path
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the underlying cause is a Kubernetes NotFound response.
    ///
    /// Callers that model absence (the installer, delete-for-namespaces)
    /// treat NotFound as a regular state rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube(kube::Error::Api(response)) if response.code == 404
        )
    }
}
