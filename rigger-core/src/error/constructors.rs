//! Constructor methods and convenience functions for RiggerError

use super::types::{RiggerError, RiggerResult};

impl RiggerError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use rigger_core::error::RiggerError;
    ///
    /// let err = RiggerError::configuration("checker.parallelism", "must be positive");
    /// assert!(err.to_string().contains("checker.parallelism"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        RiggerError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RiggerError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RiggerError::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub fn kube(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RiggerError::Kube {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        RiggerError::Security {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RiggerError::Internal {
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        RiggerError::Aborted {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        RiggerError::NotFound {
            resource: resource.into(),
        }
    }

    /// Prefix `source` with what was being done.
    pub fn context(context: impl Into<String>, source: RiggerError) -> Self {
        RiggerError::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Fold a list of errors into a single result.
    ///
    /// An empty list is success, a single error is returned unchanged and
    /// anything longer becomes [`RiggerError::Multiple`].
    pub fn collect(context: impl Into<String>, mut errors: Vec<RiggerError>) -> RiggerResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RiggerError::Multiple {
                context: context.into(),
                errors,
            }),
        }
    }

    /// Returns true if this error, or any error it aggregates, matches `pred`.
    pub fn any(&self, pred: &dyn Fn(&RiggerError) -> bool) -> bool {
        match self {
            RiggerError::Multiple { errors, .. } => errors.iter().any(|e| e.any(pred)),
            RiggerError::Context { source, .. } => pred(self) || source.any(pred),
            other => pred(other),
        }
    }

    /// True for errors that the next reconcile tick is expected to clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RiggerError::Kube { .. } | RiggerError::Http { .. } | RiggerError::Timeout { .. }
        )
    }
}
