//! Error types for the hardware plugin
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object it concerns (request, node or host)
//! alongside the underlying cause.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for hardware plugin operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The request spec is malformed or cannot be satisfied as written
    #[error("validation error for {request}: {message}")]
    Validation {
        /// Name of the request with invalid input
        request: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.nodeGroup[0].size")
        field: Option<String>,
    },

    /// Not enough free hosts match a node group
    #[error("not enough free resources matching nodegroup={group} criteria: freenodes={free}, required={required}")]
    InsufficientResources {
        /// Name of the request being allocated
        request: String,
        /// Node group that could not be satisfied
        group: String,
        /// Matching free hosts found
        free: usize,
        /// Hosts the group still needs
        required: usize,
    },

    /// A physical host could not be read, claimed or released
    #[error("host error for {host}: {message}")]
    Host {
        /// Namespaced name of the host
        host: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A member cluster readiness lookup failed
    #[error("readiness check failed for {node}: {message}")]
    Readiness {
        /// AllocatedNode being checked
        node: String,
        /// Specific cause
        message: String,
    },

    /// Delivering a status callback failed
    #[error("callback to {url} failed: {message}")]
    Callback {
        /// Target URL
        url: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Work was abandoned because the process is shutting down
    #[error("cancelled during {context}")]
    Cancelled {
        /// Step that observed the cancellation
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "allocator")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            request: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with request context
    pub fn validation_for(request: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            request: request.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with request context and field path
    pub fn validation_for_field(
        request: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            request: request.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an insufficient resources error for a node group
    pub fn insufficient_resources(
        request: impl Into<String>,
        group: impl Into<String>,
        free: usize,
        required: usize,
    ) -> Self {
        Self::InsufficientResources {
            request: request.into(),
            group: group.into(),
            free,
            required,
        }
    }

    /// Create a retryable host error
    pub fn host(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Host {
            host: host.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a host error that will not clear on its own
    pub fn host_permanent(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Host {
            host: host.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a readiness error for an AllocatedNode
    pub fn readiness(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Readiness {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a callback delivery error
    pub fn callback(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Callback {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error for the given step
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
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

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec edit to clear.
    /// Kubernetes 4xx errors are not retried, except for conflicts which
    /// resolve on the next read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::InsufficientResources { .. } => true,
            Error::Host { retryable, .. } => *retryable,
            Error::Readiness { .. } => true,
            Error::Callback { .. } => true,
            Error::Serialization { .. } => false,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the error originates in the caller's input rather than infrastructure
    pub fn is_input_error(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Whether the error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether the error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the request name if this error is associated with a specific request
    pub fn request(&self) -> Option<&str> {
        match self {
            Error::Validation { request, .. } => Some(request),
            Error::InsufficientResources { request, .. } => Some(request),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Cancelled { context } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
