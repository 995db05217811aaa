//! Error conversion implementations for RiggerError
//!
//! External error types are converted here so that `?` works across crate
//! boundaries without ad-hoc `map_err` calls.

use super::types::RiggerError;

// System error conversions
impl From<std::io::Error> for RiggerError {
    fn from(err: std::io::Error) -> Self {
        RiggerError::IoError(Box::new(err))
    }
}

// Serialization error conversions
impl From<serde_json::Error> for RiggerError {
    fn from(err: serde_json::Error) -> Self {
        RiggerError::JsonError(Box::new(err))
    }
}

impl From<serde_yaml::Error> for RiggerError {
    fn from(err: serde_yaml::Error) -> Self {
        RiggerError::YamlError(Box::new(err))
    }
}

impl From<toml::de::Error> for RiggerError {
    fn from(err: toml::de::Error) -> Self {
        RiggerError::ConfigurationError {
            component: "toml".to_string(),
            message: err.to_string(),
        }
    }
}

// Kubernetes client errors are always treated as transient
impl From<kube::Error> for RiggerError {
    fn from(err: kube::Error) -> Self {
        RiggerError::Kube {
            operation: "api_request".to_string(),
            message: err.to_string(),
        }
    }
}

// Registry probes are retried on the next checker round
impl From<reqwest::Error> for RiggerError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            RiggerError::Timeout {
                operation: format!("HEAD {}", url),
                duration: std::time::Duration::from_secs(0),
            }
        } else {
            RiggerError::Http {
                url,
                message: err.to_string(),
            }
        }
    }
}

// Certificate handling
impl From<rcgen::RcgenError> for RiggerError {
    fn from(err: rcgen::RcgenError) -> Self {
        RiggerError::Security {
            message: err.to_string(),
        }
    }
}

// Async runtime conversions
impl From<tokio::task::JoinError> for RiggerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            RiggerError::Internal {
                message: format!("Task panicked: {}", err),
            }
        } else {
            RiggerError::Internal {
                message: format!("Task cancelled: {}", err),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for RiggerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RiggerError::Timeout {
            operation: "async_operation".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}

impl From<std::string::FromUtf8Error> for RiggerError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RiggerError::Parse {
            what: "utf-8 text".to_string(),
            message: err.to_string(),
        }
    }
}
