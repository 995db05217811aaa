//! Error handling for Rigger
//!
//! Every fallible operation in the workspace returns [`RiggerResult`].
//!
//! ## Propagation rules
//!
//! - Runner sentinels (`RunnerStopped`, `ApplyAborted`, `AlreadyRunning`) are
//!   surfaced to the caller unchanged so they can be matched on.
//! - Backend exits carry the filtered stderr of the child process.
//! - Hook failures and post-action failures are merged with
//!   [`RiggerError::collect`] so that none of them is lost.
//! - Kubernetes and HTTP errors are transient: loops log them and retry on
//!   the next tick.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Rigger Error Taxonomy                  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Runner            │  Logic               │  Transient   │
//! │  • Stopped         │  • Validation        │  • Kube      │
//! │  • ApplyAborted    │  • Configuration     │  • Http      │
//! │  • AlreadyRunning  │  • Transition        │  • Timeout   │
//! │  • BackendExit     │  • Parse             │              │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{format_errors, Result, RiggerError, RiggerResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_texts() {
        assert_eq!(
            RiggerError::RunnerStopped.to_string(),
            "Infrastructure runner was stopped."
        );
        assert_eq!(
            RiggerError::ApplyAborted.to_string(),
            "Infrastructure apply aborted."
        );
        assert_eq!(
            RiggerError::AlreadyRunning.to_string(),
            "Infrastructure utility have been already executed."
        );
    }

    #[test]
    fn test_collect_flattens_single_error() {
        assert!(RiggerError::collect("apply", vec![]).is_ok());

        let single = RiggerError::collect("apply", vec![RiggerError::ApplyAborted]);
        assert!(matches!(single, Err(RiggerError::ApplyAborted)));

        let many = RiggerError::collect(
            "apply",
            vec![RiggerError::ApplyAborted, RiggerError::internal("hook")],
        )
        .unwrap_err();
        assert_eq!(
            many.to_string(),
            "Multiple errors in apply: 1. Infrastructure apply aborted.; 2. Internal error: hook"
        );
        assert!(many.any(&|e| matches!(e, RiggerError::ApplyAborted)));
    }

    #[tokio::test]
    async fn test_join_error_conversion() {
        async fn task_that_panics() -> std::result::Result<(), &'static str> {
            panic!("test panic");
        }

        async fn test_function() -> RiggerResult<()> {
            let handle = tokio::spawn(task_that_panics());
            let _ = handle.await?;
            Ok(())
        }

        match test_function().await {
            Err(RiggerError::Internal { message }) => assert!(message.contains("Task panicked")),
            other => panic!("Expected Internal error, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(RiggerError::kube("get secret", "connection refused").is_transient());
        assert!(!RiggerError::validation("mode", "unknown").is_transient());
    }
}
