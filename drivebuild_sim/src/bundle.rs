//! JSON test bundles and the loader that turns them into kinematic scenarios.
//!
//! A submission is either one bundle or an array of bundles:
//!
//! ```json
//! {
//!   "test": { "name": "speeding", "participants": [{"id": "ego"}], "success": {...} },
//!   "environment": { "roads": [...], "obstacles": [...], "positionNoise": 0.0 },
//!   "vehicles": [{ "id": "ego", "mode": "autonomous", "speeds": [5.0, 8.0, 12.0] }]
//! }
//! ```

use crate::kinematics::{Environment, KinematicSimulator, VehicleSetup};
use drivebuild_core::{LoadError, LoadedTest, TestCase, TestLoader};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// One test case plus the world it runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBundle {
    pub test: TestCase,

    #[serde(default)]
    pub environment: Environment,

    pub vehicles: Vec<VehicleSetup>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Submission {
    Many(Vec<TestBundle>),
    One(Box<TestBundle>),
}

/// What gets persisted as the environment of a test record.
#[derive(Serialize)]
struct EnvironmentRecord<'a> {
    environment: &'a Environment,
    vehicles: &'a [VehicleSetup],
    seed: u64,
}

impl TestBundle {
    pub fn to_payload(bundles: &[TestBundle]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(bundles)
    }

    fn validate(&self) -> Result<(), LoadError> {
        self.test.validate()?;
        for participant in &self.test.participants {
            if !self.vehicles.iter().any(|v| v.id == participant.id) {
                return Err(LoadError::Invalid(format!(
                    "{}: participant {} has no vehicle",
                    self.test.name, participant.id
                )));
            }
        }
        Ok(())
    }

    fn load(self, seed: u64) -> Result<LoadedTest, LoadError> {
        self.validate()?;
        let seed = self.environment.seed.unwrap_or(seed);
        let environment = serde_json::to_string(&EnvironmentRecord {
            environment: &self.environment,
            vehicles: &self.vehicles,
            seed,
        })
        .map_err(|e| LoadError::Malformed(e.to_string()))?;

        let mut simulator = KinematicSimulator::new(seed, self.test.steps_per_second, self.environment)?;
        // Only participants are simulated; extra vehicles are ignored
        for participant in &self.test.participants {
            if let Some(setup) = self.vehicles.iter().find(|v| v.id == participant.id) {
                simulator.add_vehicle(setup, self.test.ai_frequency);
            }
        }
        debug!("Loaded {} with seed {}", self.test.name, seed);
        Ok(LoadedTest {
            case: self.test,
            environment,
            simulator: Box::new(simulator),
        })
    }
}

/// Loads JSON bundles into kinematic simulators.
///
/// Every loaded scenario draws the next seed, so two runs of the same
/// submission against fresh loaders produce identical noise.
pub struct BundleLoader {
    next_seed: AtomicU64,
}

impl BundleLoader {
    pub fn new(seed: u64) -> Self {
        Self {
            next_seed: AtomicU64::new(seed),
        }
    }
}

impl Default for BundleLoader {
    fn default() -> Self {
        Self::new(42)
    }
}

impl TestLoader for BundleLoader {
    fn load(&self, payload: &[u8]) -> Result<Vec<LoadedTest>, LoadError> {
        let submission: Submission =
            serde_json::from_slice(payload).map_err(|e| LoadError::Malformed(e.to_string()))?;
        let bundles = match submission {
            Submission::Many(bundles) => bundles,
            Submission::One(bundle) => vec![*bundle],
        };
        if bundles.is_empty() {
            return Err(LoadError::Malformed("the submission contains no tests".into()));
        }
        bundles
            .into_iter()
            .map(|bundle| bundle.load(self.next_seed.fetch_add(1, Ordering::SeqCst)))
            .collect()
    }
}
