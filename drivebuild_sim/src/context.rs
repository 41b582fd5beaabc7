//! Simulation context implementing DriveBuildContext for reproducible runs.

use async_trait::async_trait;
use drivebuild_env::DriveBuildContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::Instrument;

/// Context backed by a virtual clock.
///
/// This implements `DriveBuildContext` using:
/// - A virtual clock that only moves when advanced or slept on
/// - A fixed epoch, so persisted timestamps are identical across runs
/// - Simulated sleep that advances virtual time and yields to the scheduler
///
/// Verification timeouts measured through this context count simulated
/// seconds of pacing, not wall-clock seconds.
pub struct SimContext {
    /// Seed of the run, handed to the simulators the harness builds
    seed: u64,

    /// Current virtual time (nanoseconds since run start)
    virtual_time_ns: Arc<AtomicU64>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,

    /// Woken whenever the virtual clock moves
    advanced: Arc<Notify>,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
            advanced: Arc::new(Notify::new()),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        self.advanced.notify_waiters();
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        self.virtual_time_ns.store(time_ns, Ordering::SeqCst);
        self.advanced.notify_waiters();
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::SeqCst)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
            advanced: Arc::clone(&self.advanced),
        }
    }
}

#[async_trait]
impl DriveBuildContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    /// Waits for other tasks to move the clock past `deadline`.
    async fn sleep_until(&self, deadline: Duration) {
        loop {
            // Registered before the check so an advance in between is not lost
            let advanced = self.advanced.notified();
            if self.now() >= deadline {
                return;
            }
            advanced.await;
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name, seed = self.seed);
        tokio::spawn(future.instrument(span));
    }
}
