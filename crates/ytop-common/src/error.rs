//! Error types for the ytop operator
//!
//! Errors are structured with fields to aid debugging in production. The
//! taxonomy follows how a reconciliation tick treats each failure:
//!
//! - accessor failures (`Kube`, `Accessor`) are transient and retried by the
//!   next tick
//! - `Config` failures block a single component and are surfaced as its
//!   status reason
//! - `Validation` failures require a spec change
//! - `Invariant` failures are logic faults that abort the tick loudly
//!
//! A component waiting on an unready dependency is not an error at all; it is
//! reported as a `Blocked` sync status.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for ytop operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Failure reading or writing a managed object
    #[error("accessor error for {object}: {message}")]
    Accessor {
        /// Object reference (e.g. "StatefulSet/yt/ms")
        object: String,
        /// Description of what failed
        message: String,
    },

    /// Config payload generation or parsing failure
    #[error("config error for {component}: {message}")]
    Config {
        /// Component whose config could not be produced
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Validation error for the Ytsaurus spec
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.schedulers")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Broken internal invariant; the current tick must not continue
    #[error("invariant violated [{context}]: {message}")]
    Invariant {
        /// Description of the violated invariant
        message: String,
        /// Where the violation was detected (e.g. "executor", "ordering")
        context: String,
    },
}

impl Error {
    /// Create an accessor error for the given object reference
    pub fn accessor(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Accessor {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a config error for the given component
    pub fn config(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invariant violation with context
    pub fn invariant(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Accessor failures are transient. Validation, serialization and
    /// invariant failures need a spec or code fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 Conflict is an optimistic-concurrency miss, retry with fresh state
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Accessor { .. } => true,
            Error::Config { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Invariant { .. } => false,
        }
    }

    /// True for a 409 returned by a write conditioned on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True for logic faults that must abort the tick
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::Invariant { .. })
    }

    /// Short machine-readable category, used as a metrics label
    pub fn category(&self) -> &'static str {
        match self {
            Error::Kube { .. } | Error::Accessor { .. } => "accessor",
            Error::Config { .. } => "config",
            Error::Validation { .. } => "validation",
            Error::Serialization { .. } => "serialization",
            Error::Invariant { .. } => "invariant",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
