//! Test doubles shared by the unit tests of this crate.

use crate::sensors::{Road, SensorRequest, VehicleState};
use crate::simulator::{MovementMode, Simulator, SimulatorError};
use drivebuild_env::proto::AvCommand;
use drivebuild_env::VehicleId;
use nalgebra::Vector3;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct ScriptedVehicle {
    vid: VehicleId,
    speeds: Vec<f64>,
    mode: MovementMode,
    damage_from_step: Option<usize>,
}

/// Simulator whose vehicles follow a speed script indexed by step count.
pub(crate) struct ScriptedSimulator {
    vehicles: Vec<ScriptedVehicle>,
    steps: usize,
    tick: u64,
    closed: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<(VehicleId, AvCommand)>>>,
    fail_polls: bool,
}

impl ScriptedSimulator {
    pub fn with_speeds(vid: &str, speeds: &[f64]) -> Self {
        let mut sim = Self {
            vehicles: Vec::new(),
            steps: 0,
            tick: 0,
            closed: Arc::new(AtomicBool::new(false)),
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_polls: false,
        };
        sim.add_vehicle(vid, speeds, MovementMode::Manual);
        sim
    }

    pub fn add_vehicle(&mut self, vid: &str, speeds: &[f64], mode: MovementMode) {
        self.vehicles.push(ScriptedVehicle {
            vid: VehicleId::new(vid),
            speeds: speeds.to_vec(),
            mode,
            damage_from_step: None,
        });
    }

    pub fn set_mode(&mut self, vid: &str, mode: MovementMode) {
        if let Some(v) = self.vehicles.iter_mut().find(|v| v.vid.as_str() == vid) {
            v.mode = mode;
        }
    }

    pub fn damage_after(&mut self, vid: &str, step: usize) {
        if let Some(v) = self.vehicles.iter_mut().find(|v| v.vid.as_str() == vid) {
            v.damage_from_step = Some(step);
        }
    }

    pub fn failing_polls(mut self) -> Self {
        self.fail_polls = true;
        self
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    pub fn command_log(&self) -> Arc<Mutex<Vec<(VehicleId, AvCommand)>>> {
        self.commands.clone()
    }

    fn find(&self, vid: &VehicleId) -> Option<&ScriptedVehicle> {
        self.vehicles.iter().find(|v| &v.vid == vid)
    }
}

impl Simulator for ScriptedSimulator {
    fn vehicles(&self) -> Vec<VehicleId> {
        self.vehicles.iter().map(|v| v.vid.clone()).collect()
    }

    fn attach_sensor(&mut self, vid: &VehicleId, _rid: &str, _request: SensorRequest) -> Result<(), SimulatorError> {
        self.find(vid)
            .map(|_| ())
            .ok_or_else(|| SimulatorError::UnknownVehicle(vid.to_string()))
    }

    fn poll(&mut self, vid: &VehicleId) -> Result<VehicleState, SimulatorError> {
        if self.fail_polls {
            return Err(SimulatorError::Sensor("scripted failure".into()));
        }
        let steps = self.steps;
        let tick = self.tick;
        let vehicle = self
            .find(vid)
            .ok_or_else(|| SimulatorError::UnknownVehicle(vid.to_string()))?;
        let speed = vehicle
            .speeds
            .get(steps)
            .or(vehicle.speeds.last())
            .copied()
            .unwrap_or(0.0);
        let damaged = vehicle.damage_from_step.map_or(false, |from| steps >= from);
        Ok(VehicleState {
            tick,
            position: Vector3::new(steps as f64 * 10.0, 0.0, 0.0),
            velocity: Vector3::new(speed, 0.0, 0.0),
            damage: if damaged { 1.0 } else { 0.0 },
            ..Default::default()
        })
    }

    fn step(&mut self, ticks: u32) -> Result<(), SimulatorError> {
        self.steps += 1;
        self.tick += ticks as u64;
        Ok(())
    }

    fn current_tick(&self) -> u64 {
        self.tick
    }

    fn movement_mode(&self, vid: &VehicleId) -> Option<MovementMode> {
        self.find(vid).map(|v| v.mode)
    }

    fn control(&mut self, vid: &VehicleId, command: &AvCommand) -> Result<(), SimulatorError> {
        self.commands
            .lock()
            .unwrap()
            .push((vid.clone(), command.clone()));
        Ok(())
    }

    fn roads(&self) -> Vec<Road> {
        vec![Road::straight("main", -10.0, 1000.0, 0.0, 8.0)]
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
