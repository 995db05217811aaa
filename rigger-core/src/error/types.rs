//! Core error types for Rigger
//!
//! This module contains the main RiggerError enum with all error variants
//! and associated type aliases for Result types.

use thiserror::Error;

/// Error type shared by the infrastructure and registry subsystems
///
/// # Error Categories
///
/// - **Runner Sentinels**: stopped, aborted and concurrent-use refusals raised by a runner
/// - **Backend Errors**: non-zero exits of the infrastructure utility
/// - **Logic Errors**: validation, configuration and unsupported transitions
/// - **Transient Errors**: Kubernetes and HTTP failures that are retried by the next tick
#[derive(Error, Debug)]
pub enum RiggerError {
    // Runner sentinels
    #[error("Infrastructure runner was stopped.")]
    RunnerStopped,

    #[error("Infrastructure apply aborted.")]
    ApplyAborted,

    #[error("Infrastructure utility have been already executed.")]
    AlreadyRunning,

    #[error("{message}")]
    Aborted { message: String },

    // Backend
    #[error("{message}")]
    BackendExit { exit_code: i32, message: String },

    // Parsing
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    // Registry orchestrator
    #[error("transition from {from:?} to {to:?} is not supported")]
    TransitionNotSupported { from: String, to: String },

    // Configuration and validation
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Transient
    #[error("Kubernetes operation '{operation}' failed: {message}")]
    Kube { operation: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Http { url: String, message: String },

    // Security
    #[error("Security error: {message}")]
    Security { message: String },

    // Resource and operational
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },

    // Serialization & IO
    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("YAML error: {0}")]
    YamlError(#[from] Box<serde_yaml::Error>),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<RiggerError>,
    },

    // Multiple Errors
    #[error("Multiple errors in {context}: {}", format_errors(.errors))]
    Multiple {
        context: String,
        errors: Vec<RiggerError>,
    },
}

// Helper function to format multiple errors
pub fn format_errors(errors: &[RiggerError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RiggerError>;
pub type RiggerResult<T> = std::result::Result<T, RiggerError>;
