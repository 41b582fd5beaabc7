//! Scenario runner - submits built-in scenarios to a local cluster.

use crate::bundle::TestBundle;
use crate::cluster::{ClusterConfig, ClusterError, LocalCluster};
use crate::driver;
use crate::scenarios::ScenarioId;
use drivebuild_core::{ClientError, SimState, Verdict, VerificationConfig};
use drivebuild_env::proto;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const USERNAME: &str = "scenario-runner";
const PASSWORD: &str = "scenario-runner";

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether verdict and status matched the expectation
    pub passed: bool,

    pub verdict: Verdict,

    pub state: SimState,

    pub expected_verdict: Verdict,

    pub expected_state: SimState,

    /// Verification cycles persisted for the simulation
    pub cycles: usize,

    /// Commands sent by AI drivers
    pub ai_turns: u64,

    /// Wall-clock duration of the run
    pub elapsed_ms: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

/// Runs scenarios, each against its own fresh cluster.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of simulation nodes
    nodes: usize,

    /// Verification budget in simulated seconds
    timeout: Duration,

    /// Wall-clock limit for one scenario
    deadline: Duration,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, nodes: usize) -> Self {
        Self {
            seed,
            nodes: nodes.max(1),
            timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(120),
        }
    }

    /// Sets the verification timeout in simulated seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the wall-clock limit per scenario.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            seed: self.seed,
            nodes: self.nodes,
            verification: VerificationConfig {
                timeout: Some(self.timeout),
                pace: Some(Duration::from_millis(100)),
            },
            ..Default::default()
        }
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let started = Instant::now();
        let (expected_verdict, expected_state) = scenario.expected();
        let mut result = ScenarioResult {
            scenario: scenario.name().to_string(),
            seed: self.seed,
            passed: false,
            verdict: Verdict::Unknown,
            state: SimState::Unknown,
            expected_verdict,
            expected_state,
            cycles: 0,
            ai_turns: 0,
            elapsed_ms: 0,
            failure_reason: None,
        };

        match self.execute(scenario, &mut result).await {
            Ok(()) => {
                result.passed = result.verdict == expected_verdict && result.state == expected_state;
                if !result.passed {
                    result.failure_reason = Some(format!(
                        "expected {:?}/{:?}, got {:?}/{:?}",
                        expected_verdict, expected_state, result.verdict, result.state
                    ));
                }
            }
            Err(reason) => result.failure_reason = Some(reason),
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        if result.passed {
            info!("Scenario {} passed: {:?}/{:?}", scenario, result.verdict, result.state);
        } else {
            warn!(
                "Scenario {} failed: {}",
                scenario,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        result
    }

    /// Runs scenarios one after another.
    pub async fn run_all(&self, scenarios: &[ScenarioId]) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            results.push(self.run(*scenario).await);
        }
        results
    }

    async fn execute(&self, scenario: ScenarioId, result: &mut ScenarioResult) -> Result<(), String> {
        let cluster = LocalCluster::start(self.cluster_config())
            .await
            .map_err(|e: ClusterError| format!("cluster did not start: {}", e))?;
        cluster
            .add_user(USERNAME, PASSWORD)
            .map_err(|e| format!("adding the runner user failed: {}", e))?;

        let client = cluster.client().await.map_err(describe)?;
        let payload = TestBundle::to_payload(&[scenario.bundle()]).map_err(|e| e.to_string())?;
        let submitted = client
            .run_tests(&payload, &proto::User::new(USERNAME, PASSWORD))
            .await
            .map_err(describe)?;
        let sid = submitted
            .get(scenario.name())
            .cloned()
            .ok_or_else(|| format!("{} was not started: {:?}", scenario, submitted))?;

        let mut drivers = Vec::new();
        for (vid, cruise) in scenario.drivers() {
            let ai_client = cluster.client().await.map_err(describe)?;
            let sid = sid.clone();
            drivers.push(tokio::spawn(async move {
                driver::drive(&ai_client, &sid, &vid, &cruise).await
            }));
        }

        let deadline = Instant::now() + self.deadline;
        loop {
            let state = client.status(&sid).await.map_err(describe)?;
            if state != SimState::Running {
                result.state = state;
                break;
            }
            if Instant::now() >= deadline {
                let _ = client.stop(&sid, Verdict::Unknown).await;
                return Err(format!("{} did not finish within {:?}", scenario, self.deadline));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        result.verdict = client.result(&sid).await.map_err(describe)?;
        result.cycles = client.trace(&sid, None).await.map_err(describe)?.entries.len();
        for handle in drivers {
            match handle.await {
                Ok(Ok(summary)) => result.ai_turns += summary.turns,
                Ok(Err(e)) => warn!("AI driver failed: {}", e),
                Err(e) => warn!("AI driver panicked: {}", e),
            }
        }
        Ok(())
    }
}

fn describe(error: ClientError) -> String {
    error.to_string()
}
