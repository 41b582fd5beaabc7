//! Runtime context trait shared by the node, the main application and the harness.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The interface DriveBuild services use for time and task spawning.
///
/// The verification loop measures its wall-clock timeout and paces itself
/// through this trait so the harness can substitute a virtual clock.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Harness**: `SimContext` in `drivebuild_sim` - manually advanced clock
#[async_trait]
pub trait DriveBuildContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for persisted timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Suspends execution until `now()` reaches `deadline`.
    ///
    /// Unlike [`sleep`](Self::sleep) this never moves the clock itself, so
    /// it can bound a wait without advancing a virtual clock.
    async fn sleep_until(&self, deadline: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
