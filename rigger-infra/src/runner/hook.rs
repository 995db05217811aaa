//! Hooks around apply and destroy

use super::Runner;
use async_trait::async_trait;
use rigger_core::error::RiggerResult;

/// Caller-provided actions wrapped around a change to the cloud.
///
/// `before_action` returns whether `after_action` must run if the readiness
/// check fails.
#[async_trait]
pub trait InfraActionHook: Send + Sync {
    async fn before_action(&self, runner: &Runner) -> RiggerResult<bool>;

    async fn is_ready(&self) -> RiggerResult<()>;

    async fn after_action(&self, runner: &Runner) -> RiggerResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl InfraActionHook for NoopHook {
    async fn before_action(&self, _runner: &Runner) -> RiggerResult<bool> {
        Ok(false)
    }

    async fn is_ready(&self) -> RiggerResult<()> {
        Ok(())
    }

    async fn after_action(&self, _runner: &Runner) -> RiggerResult<()> {
        Ok(())
    }
}
