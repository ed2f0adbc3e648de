//! Error types for the external cluster provider
//!
//! Errors carry enough context (resource names, the failing remote
//! operation, the health check involved) to be logged and recorded on
//! status without further decoration.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error against the management cluster
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The kubeconfig could not be parsed or turned into a client
    #[error("invalid kubeconfig: {message}")]
    Kubeconfig {
        /// Description of what's invalid
        message: String,
    },

    /// A call against the external cluster's API failed
    #[error("remote cluster {operation} failed: {message}")]
    RemoteAccess {
        /// The remote operation (e.g., "list nodes")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A named health check failed and was recorded on status
    #[error("{check} check failed ({reason}): {message}")]
    HealthCheck {
        /// Name of the failing check (the condition type)
        check: String,
        /// Machine-readable reason recorded on the condition
        reason: String,
        /// Human-readable message recorded on the condition
        message: String,
    },

    /// A resource lacks a field required to work with it
    #[error("{kind} {name} is missing required field {field}")]
    MissingField {
        /// Resource kind
        kind: String,
        /// Resource name (or `unknown`)
        name: String,
        /// The missing field path (e.g., "metadata.namespace")
        field: String,
    },

    /// Optimistic concurrency could not be resolved
    #[error("conflict persisting {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scope", "remote")
        context: String,
    },
}

impl Error {
    /// Create a kubeconfig error
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            message: msg.into(),
        }
    }

    /// Create a remote access error for the given operation
    pub fn remote(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteAccess {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a health check error
    pub fn health_check(
        check: impl Into<String>,
        reason: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::HealthCheck {
            check: check.into(),
            reason: reason.into(),
            message: msg.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(
        kind: impl Into<String>,
        name: Option<&str>,
        field: impl Into<String>,
    ) -> Self {
        Self::MissingField {
            kind: kind.into(),
            name: name.unwrap_or(UNKNOWN_CONTEXT).to_string(),
            field: field.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the management cluster rejected a write because the
    /// object changed since it was read
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube { source } => crate::kube_utils::is_conflict(source),
            Error::Conflict { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Health check, remote access, and conflict errors clear up on their
    /// own. Missing fields and serialization errors need a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Kubeconfig { .. } => true,
            Error::RemoteAccess { .. } => true,
            Error::HealthCheck { .. } => true,
            Error::MissingField { .. } => false,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Machine-readable reason when this error came from a health check
    pub fn reason(&self) -> Option<&str> {
        match self {
            Error::HealthCheck { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
