//! Parsed test cases and the loader seam that produces them.

use crate::criteria::{CriteriaError, Evaluable};
use crate::sensors::SensorRequest;
use crate::simulator::{Simulator, SimulatorError};
use drivebuild_env::VehicleId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// One participant vehicle and the named data requests its AI may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: VehicleId,
    #[serde(default)]
    pub requests: BTreeMap<String, SensorRequest>,
}

/// Criteria and pacing of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,

    #[serde(default)]
    pub authors: Vec<String>,

    /// Simulator ticks per simulated second
    #[serde(default = "default_steps_per_second")]
    pub steps_per_second: u32,

    /// Ticks simulated between two AI turns
    #[serde(default = "default_ai_frequency")]
    pub ai_frequency: u32,

    #[serde(default)]
    pub precondition: Evaluable,

    #[serde(default)]
    pub success: Evaluable,

    #[serde(default)]
    pub failure: Evaluable,

    pub participants: Vec<Participant>,
}

fn default_steps_per_second() -> u32 {
    60
}

fn default_ai_frequency() -> u32 {
    6
}

impl TestCase {
    pub fn participant(&self, vid: &VehicleId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == vid)
    }

    /// Every sensor request the three criteria read.
    pub fn criteria_requests(&self) -> Vec<(VehicleId, SensorRequest)> {
        let mut requests = self.precondition.requests();
        requests.extend(self.failure.requests());
        requests.extend(self.success.requests());
        requests.sort();
        requests.dedup();
        requests
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.name.is_empty() {
            return Err(LoadError::Invalid("test case has no name".into()));
        }
        if self.ai_frequency == 0 || self.steps_per_second == 0 {
            return Err(LoadError::Invalid(format!(
                "{}: aiFrequency and stepsPerSecond must be positive",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for participant in &self.participants {
            if !seen.insert(&participant.id) {
                return Err(LoadError::Invalid(format!(
                    "{}: duplicate participant {}",
                    self.name, participant.id
                )));
            }
        }
        for criterion in [&self.precondition, &self.success, &self.failure] {
            criterion.validate()?;
        }
        for (vid, _) in self.criteria_requests() {
            if !seen.contains(&vid) {
                return Err(LoadError::Invalid(format!(
                    "{}: criteria refer to unknown participant {}",
                    self.name, vid
                )));
            }
        }
        Ok(())
    }
}

/// A test case together with its loaded, paused scenario.
pub struct LoadedTest {
    pub case: TestCase,

    /// Serialized environment description, kept for the test record
    pub environment: String,

    pub simulator: Box<dyn Simulator>,
}

/// Errors while turning a submission into runnable tests.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Malformed submission: {0}")]
    Malformed(String),

    #[error("Invalid test case: {0}")]
    Invalid(String),

    #[error(transparent)]
    Criteria(#[from] CriteriaError),

    #[error("Simulator error: {0}")]
    Simulator(#[from] SimulatorError),

    #[error("Work directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a raw submission payload into loaded scenarios.
///
/// Scenario construction belongs to the simulator side; the node only
/// sees the result.
pub trait TestLoader: Send + Sync {
    fn load(&self, payload: &[u8]) -> Result<Vec<LoadedTest>, LoadError>;
}
