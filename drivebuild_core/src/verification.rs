//! Runtime verification loop.
//!
//! One loop runs per simulation, started right after the scenario has been
//! loaded and paused:
//!
//! ```text
//!   ┌──────────────┐
//!   │ poll sensors │◄──────────────────────────────────────┐
//!   └──────┬───────┘                                       │
//!          ▼                                               │
//!   ┌──────────────────────────────┐  verdict   ┌───────┐  │
//!   │ precondition / failure /     ├───────────►│ finish│  │
//!   │ success (Kleene-Priest)      │            └───────┘  │
//!   └──────┬───────────────────────┘                       │
//!          ▼ still running                                 │
//!   ┌──────────────────────────────┐   ┌────────────────┐  │
//!   │ request_ai_for each AI car   ├──►│ step aiFreq    ├──┘
//!   └──────────────────────────────┘   └────────────────┘
//! ```
//!
//! The first matching rule decides: precondition FALSE is SKIPPED, failure
//! TRUE is FAILED, success TRUE is SUCCEEDED.

use crate::criteria::KpValue;
use crate::rendezvous::{RendezvousBarrier, Release};
use crate::simulation::Simulation;
use crate::simulator::SimulatorError;
use crate::store::TestStore;
use chrono::{DateTime, Utc};
use drivebuild_env::proto;
use drivebuild_env::DriveBuildContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// VERDICTS AND STATES
// ============================================================================

/// Final classification of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Succeeded,
    Failed,
    Skipped,
    Unknown,
}

impl From<Verdict> for proto::TestVerdict {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Succeeded => proto::TestVerdict::Succeeded,
            Verdict::Failed => proto::TestVerdict::Failed,
            Verdict::Skipped => proto::TestVerdict::Skipped,
            Verdict::Unknown => proto::TestVerdict::Unknown,
        }
    }
}

impl From<proto::TestVerdict> for Verdict {
    fn from(verdict: proto::TestVerdict) -> Self {
        match verdict {
            proto::TestVerdict::Succeeded => Verdict::Succeeded,
            proto::TestVerdict::Failed => Verdict::Failed,
            proto::TestVerdict::Skipped => Verdict::Skipped,
            proto::TestVerdict::Unknown => Verdict::Unknown,
        }
    }
}

/// Lifecycle state of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimState {
    Running,
    Finished,
    Canceled,
    Errored,
    Timeout,
    Unknown,
}

impl From<SimState> for proto::SimState {
    fn from(state: SimState) -> Self {
        match state {
            SimState::Running => proto::SimState::Running,
            SimState::Finished => proto::SimState::Finished,
            SimState::Canceled => proto::SimState::Canceled,
            SimState::Errored => proto::SimState::Errored,
            SimState::Timeout => proto::SimState::Timeout,
            SimState::Unknown => proto::SimState::Unknown,
        }
    }
}

impl From<proto::SimState> for SimState {
    fn from(state: proto::SimState) -> Self {
        match state {
            proto::SimState::Running => SimState::Running,
            proto::SimState::Finished => SimState::Finished,
            proto::SimState::Canceled => SimState::Canceled,
            proto::SimState::Errored => SimState::Errored,
            proto::SimState::Timeout => SimState::Timeout,
            proto::SimState::Unknown => SimState::Unknown,
        }
    }
}

/// Terminal verdict plus the state it leaves the simulation in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub state: SimState,
}

impl Outcome {
    /// Outcome of an evaluated or externally forced verdict.
    pub fn from_verdict(verdict: Verdict) -> Self {
        let state = match verdict {
            Verdict::Succeeded | Verdict::Failed => SimState::Finished,
            Verdict::Skipped | Verdict::Unknown => SimState::Canceled,
        };
        Self { verdict, state }
    }

    /// Wall-clock budget exhausted without a verdict.
    pub fn timed_out() -> Self {
        Self {
            verdict: Verdict::Unknown,
            state: SimState::Timeout,
        }
    }

    /// The simulator failed while the loop was driving it.
    pub fn errored() -> Self {
        Self {
            verdict: Verdict::Unknown,
            state: SimState::Errored,
        }
    }
}

/// One three-valued evaluation of all criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriteriaEvaluation {
    pub precondition: KpValue,
    pub failure: KpValue,
    pub success: KpValue,
}

impl CriteriaEvaluation {
    /// Applies the termination rules in priority order.
    pub fn verdict(&self) -> Option<Verdict> {
        if self.precondition.is_false() {
            Some(Verdict::Skipped)
        } else if self.failure.is_true() {
            Some(Verdict::Failed)
        } else if self.success.is_true() {
            Some(Verdict::Succeeded)
        } else {
            None
        }
    }

    pub fn to_proto(&self) -> proto::VerificationResult {
        proto::VerificationResult {
            precondition: self.precondition.to_string(),
            failure: self.failure.to_string(),
            success: self.success.to_string(),
        }
    }
}

// ============================================================================
// LOOP
// ============================================================================

/// Tuning of the verification loop.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Wall-clock budget of one test; `None` runs until a verdict
    pub timeout: Option<Duration>,

    /// Pause after every cycle
    pub pace: Option<Duration>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(600)),
            pace: None,
        }
    }
}

/// Converts a context's wall clock into a persisted timestamp.
pub(crate) fn timestamp<Ctx: DriveBuildContext>(ctx: &Ctx) -> DateTime<Utc> {
    DateTime::<Utc>::from(ctx.system_time())
}

/// Drives one simulation until it reaches a terminal outcome.
///
/// An external stop sets the outcome and closes the simulator; the loop
/// observes that at the start of the next cycle, or immediately if it is
/// blocked in the rendezvous. The timeout also bounds every wait for an AI
/// turn.
pub async fn run_verification<Ctx: DriveBuildContext>(
    ctx: Arc<Ctx>,
    sim: Arc<Simulation>,
    barrier: Arc<RendezvousBarrier>,
    store: Arc<dyn TestStore>,
    config: VerificationConfig,
) -> Outcome {
    let deadline = config.timeout.map(|limit| ctx.now() + limit);
    let ai_frequency = sim.case.ai_frequency;
    info!("Verification of {} ({}) started", sim.sid, sim.case.name);

    loop {
        if let Some(outcome) = sim.outcome() {
            debug!("Verification of {} observed external stop", sim.sid);
            return outcome;
        }
        if deadline.is_some_and(|deadline| ctx.now() >= deadline) {
            warn!("Simulation {} timed out after {:?}", sim.sid, config.timeout);
            return conclude(&*ctx, &sim, &barrier, &*store, Outcome::timed_out()).await;
        }

        let cycle_started = timestamp(&*ctx);
        match sim.simulator.poll_sensors().await {
            Ok(()) => {}
            Err(SimulatorError::Closed) => continue,
            Err(e) => warn!("Polling sensors of {} failed: {}", sim.sid, e),
        }

        let evaluation = sim.evaluate().await;
        debug!(
            "{} tick {}: precondition={} failure={} success={}",
            sim.sid,
            sim.simulator.current_tick().await,
            evaluation.precondition,
            evaluation.failure,
            evaluation.success
        );
        if let Some(verdict) = evaluation.verdict() {
            info!("Simulation {} ({}) {:?}", sim.sid, sim.case.name, verdict);
            return conclude(&*ctx, &sim, &barrier, &*store, Outcome::from_verdict(verdict)).await;
        }

        sim.store_cycle(&*store, cycle_started, timestamp(&*ctx)).await;

        for vid in sim.simulator.vehicles().await {
            let wants_ai = sim
                .simulator
                .movement_mode(&vid)
                .await
                .map_or(false, |mode| mode.requests_ai());
            if !wants_ai {
                continue;
            }
            let release = match deadline {
                Some(deadline) => tokio::select! {
                    release = barrier.request_ai_for(&sim.sid, &vid) => Some(release),
                    _ = ctx.sleep_until(deadline) => None,
                },
                None => Some(barrier.request_ai_for(&sim.sid, &vid).await),
            };
            match release {
                Some(Release::Paired) => {}
                Some(Release::SimulationEnded) => break,
                None => {
                    warn!("Simulation {} timed out waiting for the AI of {}", sim.sid, vid);
                    return conclude(&*ctx, &sim, &barrier, &*store, Outcome::timed_out()).await;
                }
            }
        }
        if !sim.is_running() {
            continue;
        }

        match sim.simulator.step(ai_frequency).await {
            Ok(()) => {}
            Err(SimulatorError::Closed) => continue,
            Err(e) => {
                warn!("Stepping {} failed: {}", sim.sid, e);
                return conclude(&*ctx, &sim, &barrier, &*store, Outcome::errored()).await;
            }
        }

        if let Some(pace) = config.pace {
            ctx.sleep(pace).await;
        }
    }
}

/// Finishes the simulation, or reports whichever outcome won the race.
async fn conclude<Ctx: DriveBuildContext>(
    ctx: &Ctx,
    sim: &Simulation,
    barrier: &RendezvousBarrier,
    store: &dyn TestStore,
    outcome: Outcome,
) -> Outcome {
    sim.finish(outcome, timestamp(ctx), barrier, store).await;
    sim.outcome().unwrap_or(outcome)
}
