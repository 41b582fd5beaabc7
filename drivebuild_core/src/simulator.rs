//! Binding to the simulator engine.
//!
//! The engine itself is an external collaborator: DriveBuild only needs to
//! step it, poll vehicle state, forward AI commands and close it. The
//! binding is single-threaded, so every call goes through the instance
//! lock held by [`SimulatorHandle`].

use crate::sensors::{Road, SensorRequest, VehicleState};
use drivebuild_env::proto::AvCommand;
use drivebuild_env::VehicleId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Control regime of one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MovementMode {
    /// Driven by a scripted trajectory
    Manual,
    /// Driven by a connected AI client
    Autonomous,
    /// Driven by the simulator while an AI client observes
    Training,
    /// Driven by the simulator's own AI
    Native,
}

impl MovementMode {
    /// True for modes that hand a control turn to an AI client every cycle.
    pub fn requests_ai(self) -> bool {
        matches!(self, MovementMode::Autonomous | MovementMode::Training)
    }

    /// True when AI commands are applied to the vehicle.
    pub fn accepts_commands(self) -> bool {
        self == MovementMode::Autonomous
    }
}

/// Errors raised by a simulator binding.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("Simulator is closed")]
    Closed,

    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Simulator backend error: {0}")]
    Backend(String),
}

/// A paused, loaded scenario in the simulator engine.
pub trait Simulator: Send {
    /// Participants of the scenario.
    fn vehicles(&self) -> Vec<VehicleId>;

    /// Registers a named data request on a vehicle.
    fn attach_sensor(
        &mut self,
        vid: &VehicleId,
        rid: &str,
        request: SensorRequest,
    ) -> Result<(), SimulatorError>;

    /// Reads the current state of a vehicle.
    fn poll(&mut self, vid: &VehicleId) -> Result<VehicleState, SimulatorError>;

    /// Advances the scenario by `ticks` ticks and pauses again.
    fn step(&mut self, ticks: u32) -> Result<(), SimulatorError>;

    /// Ticks simulated so far.
    fn current_tick(&self) -> u64;

    /// Current control regime of a vehicle.
    fn movement_mode(&self, vid: &VehicleId) -> Option<MovementMode>;

    /// Applies an AI command to a vehicle.
    fn control(&mut self, vid: &VehicleId, command: &AvCommand) -> Result<(), SimulatorError>;

    /// Road geometry of the scenario.
    fn roads(&self) -> Vec<Road>;

    /// Releases the engine instance.
    fn close(&mut self);
}

struct Instance {
    simulator: Box<dyn Simulator>,
    cache: HashMap<VehicleId, VehicleState>,
    open: bool,
}

/// Shared, lock-guarded simulator instance plus its sensor cache.
pub struct SimulatorHandle {
    instance: Mutex<Instance>,
    roads: Vec<Road>,
}

impl SimulatorHandle {
    pub fn new(simulator: Box<dyn Simulator>) -> Self {
        let roads = simulator.roads();
        Self {
            instance: Mutex::new(Instance {
                simulator,
                cache: HashMap::new(),
                open: true,
            }),
            roads,
        }
    }

    /// Road geometry, captured when the scenario was loaded.
    pub fn roads(&self) -> &[Road] {
        &self.roads
    }

    pub async fn is_open(&self) -> bool {
        self.instance.lock().await.open
    }

    pub async fn vehicles(&self) -> Vec<VehicleId> {
        self.instance.lock().await.simulator.vehicles()
    }

    pub async fn attach_sensor(
        &self,
        vid: &VehicleId,
        rid: &str,
        request: SensorRequest,
    ) -> Result<(), SimulatorError> {
        let mut instance = self.instance.lock().await;
        instance.simulator.attach_sensor(vid, rid, request)
    }

    /// Polls every participant and refreshes the cache.
    ///
    /// A vehicle whose poll fails keeps no cached state for this cycle, so
    /// criteria reading it evaluate to UNKNOWN.
    pub async fn poll_sensors(&self) -> Result<(), SimulatorError> {
        let mut instance = self.instance.lock().await;
        if !instance.open {
            return Err(SimulatorError::Closed);
        }
        let Instance { simulator, cache, .. } = &mut *instance;
        for vid in simulator.vehicles() {
            match simulator.poll(&vid) {
                Ok(state) => {
                    cache.insert(vid, state);
                }
                Err(e) => {
                    warn!("Polling {} failed: {}", vid, e);
                    cache.remove(&vid);
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the last polled states.
    pub async fn cached(&self) -> HashMap<VehicleId, VehicleState> {
        self.instance.lock().await.cache.clone()
    }

    pub async fn cached_vehicle(&self, vid: &VehicleId) -> Option<VehicleState> {
        self.instance.lock().await.cache.get(vid).cloned()
    }

    pub async fn step(&self, ticks: u32) -> Result<(), SimulatorError> {
        let mut instance = self.instance.lock().await;
        if !instance.open {
            return Err(SimulatorError::Closed);
        }
        instance.simulator.step(ticks)
    }

    pub async fn current_tick(&self) -> u64 {
        self.instance.lock().await.simulator.current_tick()
    }

    pub async fn movement_mode(&self, vid: &VehicleId) -> Option<MovementMode> {
        self.instance.lock().await.simulator.movement_mode(vid)
    }

    /// Applies an AI command if the vehicle is driven autonomously.
    ///
    /// Returns false when the command was ignored.
    pub async fn control(&self, vid: &VehicleId, command: &AvCommand) -> Result<bool, SimulatorError> {
        let mut instance = self.instance.lock().await;
        if !instance.open {
            return Err(SimulatorError::Closed);
        }
        match instance.simulator.movement_mode(vid) {
            Some(mode) if mode.accepts_commands() => {
                instance.simulator.control(vid, command)?;
                Ok(true)
            }
            Some(mode) => {
                debug!("Ignoring command for {} in {:?} mode", vid, mode);
                Ok(false)
            }
            None => Err(SimulatorError::UnknownVehicle(vid.to_string())),
        }
    }

    /// Closes the engine instance once.
    pub async fn close(&self) {
        let mut instance = self.instance.lock().await;
        if instance.open {
            instance.simulator.close();
            instance.open = false;
        }
    }
}
