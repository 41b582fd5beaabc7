//! Kinematic stand-in for the simulator engine.
//!
//! The engine maintains the ground truth of a scenario:
//! - True pose, speed and damage of every vehicle
//! - A bicycle model driven by AI commands or scripted speed profiles
//! - Sensor readings generated from ground truth (with seeded noise)

use drivebuild_core::{CarLight, MovementMode, Road, SensorRequest, Simulator, SimulatorError, VehicleState};
use drivebuild_env::proto::AvCommand;
use drivebuild_env::VehicleId;
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Vehicle footprint in meters.
pub const VEHICLE_LENGTH: f64 = 4.5;
pub const VEHICLE_WIDTH: f64 = 1.8;
const WHEELBASE: f64 = 2.7;

/// Full throttle and full brake in m/s².
const MAX_ACCELERATION: f64 = 4.0;
const MAX_DECELERATION: f64 = 8.0;

/// Steering lock in degrees.
const MAX_STEERING: f64 = 35.0;

const LIDAR_RAYS: usize = 36;
const LIDAR_RANGE: f64 = 100.0;

/// Initial state of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSetup {
    pub id: VehicleId,

    #[serde(default)]
    pub x: f64,

    #[serde(default)]
    pub y: f64,

    /// Heading in degrees, 0 along the x axis
    #[serde(default)]
    pub heading: f64,

    /// Initial speed in m/s
    #[serde(default)]
    pub speed: f64,

    #[serde(default = "default_mode")]
    pub mode: MovementMode,

    /// Scripted speeds; entry `k` holds from tick `k * speed_interval`
    #[serde(default)]
    pub speeds: Vec<f64>,

    /// Ticks per scripted speed, defaults to the test's AI frequency
    #[serde(default)]
    pub speed_interval: Option<u32>,

    #[serde(default)]
    pub lights: Vec<CarLight>,
}

fn default_mode() -> MovementMode {
    MovementMode::Manual
}

impl VehicleSetup {
    pub fn new(id: &str, mode: MovementMode) -> Self {
        Self {
            id: VehicleId::new(id),
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            speed: 0.0,
            mode,
            speeds: Vec::new(),
            speed_interval: None,
            lights: Vec::new(),
        }
    }
}

/// A round obstacle. Driving into it damages the vehicle and stops it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

/// Static world of a scenario.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub roads: Vec<Road>,

    #[serde(default)]
    pub obstacles: Vec<Obstacle>,

    /// Standard deviation of polled positions in meters
    #[serde(default)]
    pub position_noise: f64,

    /// Overrides the loader's seed for this scenario
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Ground truth of one vehicle.
#[derive(Debug, Clone)]
struct SimVehicle {
    id: VehicleId,
    position: Vector3<f64>,
    /// Heading in radians
    heading: f64,
    speed: f64,
    steering: f64,
    damage: f64,
    crashed: bool,
    mode: MovementMode,
    profile: Vec<f64>,
    interval: u32,
    lights: Vec<CarLight>,
    command: AvCommand,
    requests: BTreeMap<String, SensorRequest>,
}

impl SimVehicle {
    fn from_setup(setup: &VehicleSetup, default_interval: u32) -> Self {
        let speed = setup.speeds.first().copied().unwrap_or(setup.speed);
        Self {
            id: setup.id.clone(),
            position: Vector3::new(setup.x, setup.y, 0.0),
            heading: setup.heading.to_radians(),
            speed,
            steering: 0.0,
            damage: 0.0,
            crashed: false,
            mode: setup.mode,
            profile: setup.speeds.clone(),
            interval: setup.speed_interval.unwrap_or(default_interval).max(1),
            lights: setup.lights.clone(),
            command: AvCommand::default(),
            requests: BTreeMap::new(),
        }
    }

    fn direction(&self) -> Vector3<f64> {
        Vector3::new(self.heading.cos(), self.heading.sin(), 0.0)
    }

    /// Advances one tick of `dt` seconds; `tick` is the tick being entered.
    fn advance(&mut self, dt: f64, tick: u64) {
        if self.crashed {
            self.speed = 0.0;
            return;
        }
        if !self.profile.is_empty() {
            let index = (tick / self.interval as u64) as usize;
            self.speed = self.profile[index.min(self.profile.len() - 1)];
        } else if self.mode == MovementMode::Autonomous {
            let throttle = self.command.accelerate.clamp(0.0, 1.0) * MAX_ACCELERATION;
            let brake = self.command.brake.clamp(0.0, 1.0) * MAX_DECELERATION;
            self.speed = (self.speed + (throttle - brake) * dt).max(0.0);
            self.steering = self.command.steer.clamp(-1.0, 1.0) * MAX_STEERING;
            self.heading += self.speed * self.steering.to_radians().tan() / WHEELBASE * dt;
        }
        self.position += self.direction() * self.speed * dt;
    }

    fn collide(&mut self, obstacles: &[Obstacle]) {
        if self.crashed {
            return;
        }
        let hit = obstacles.iter().any(|o| {
            let dx = self.position.x - o.x;
            let dy = self.position.y - o.y;
            (dx * dx + dy * dy).sqrt() < o.radius + VEHICLE_LENGTH / 2.0
        });
        if hit {
            debug!("{} crashed at {:.1} m/s", self.id, self.speed);
            self.damage += self.speed.max(1.0);
            self.speed = 0.0;
            self.crashed = true;
        }
    }

    fn bbox(&self) -> Vec<[f64; 2]> {
        let forward = self.direction() * (VEHICLE_LENGTH / 2.0);
        let left = Vector3::new(-self.heading.sin(), self.heading.cos(), 0.0) * (VEHICLE_WIDTH / 2.0);
        [
            self.position + forward + left,
            self.position + forward - left,
            self.position - forward - left,
            self.position - forward + left,
        ]
        .iter()
        .map(|c| [c.x, c.y])
        .collect()
    }

    /// Distances along evenly spread rays, starting straight ahead.
    fn lidar(&self, obstacles: &[Obstacle]) -> Vec<f64> {
        (0..LIDAR_RAYS)
            .map(|i| {
                let angle = self.heading + std::f64::consts::TAU * i as f64 / LIDAR_RAYS as f64;
                let (dx, dy) = (angle.cos(), angle.sin());
                obstacles
                    .iter()
                    .filter_map(|o| ray_hit(self.position.x, self.position.y, dx, dy, o))
                    .fold(LIDAR_RANGE, f64::min)
            })
            .collect()
    }
}

/// Distance along a unit ray to the first intersection with a circle.
fn ray_hit(x: f64, y: f64, dx: f64, dy: f64, obstacle: &Obstacle) -> Option<f64> {
    let (ox, oy) = (x - obstacle.x, y - obstacle.y);
    let b = ox * dx + oy * dy;
    let c = ox * ox + oy * oy - obstacle.radius * obstacle.radius;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let root = discriminant.sqrt();
    [-b - root, -b + root].into_iter().find(|t| *t >= 0.0)
}

/// Single-threaded kinematic simulator for one scenario.
pub struct KinematicSimulator {
    /// Seed of the noise RNG
    seed: u64,

    rng: ChaCha8Rng,

    noise: Option<Normal<f64>>,

    /// Vehicles in participant order
    vehicles: Vec<SimVehicle>,

    environment: Environment,

    /// Seconds per tick
    dt: f64,

    tick: u64,

    open: bool,
}

impl KinematicSimulator {
    /// Creates a paused simulator at tick 0.
    pub fn new(seed: u64, steps_per_second: u32, environment: Environment) -> Result<Self, SimulatorError> {
        if steps_per_second == 0 {
            return Err(SimulatorError::Backend("stepsPerSecond must be positive".into()));
        }
        let noise = if environment.position_noise > 0.0 {
            let normal = Normal::new(0.0, environment.position_noise)
                .map_err(|e| SimulatorError::Backend(format!("position noise: {}", e)))?;
            Some(normal)
        } else {
            None
        };
        Ok(Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise,
            vehicles: Vec::new(),
            environment,
            dt: 1.0 / steps_per_second as f64,
            tick: 0,
            open: true,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Places a vehicle. Scripted speeds without an interval switch every
    /// `default_interval` ticks.
    pub fn add_vehicle(&mut self, setup: &VehicleSetup, default_interval: u32) {
        self.vehicles.push(SimVehicle::from_setup(setup, default_interval));
    }

    pub fn set_mode(&mut self, vid: &VehicleId, mode: MovementMode) -> Result<(), SimulatorError> {
        self.vehicle_mut(vid)?.mode = mode;
        Ok(())
    }

    /// Rids attached to a vehicle.
    pub fn attached(&self, vid: &VehicleId) -> Vec<String> {
        self.vehicles
            .iter()
            .find(|v| &v.id == vid)
            .map(|v| v.requests.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn vehicle_mut(&mut self, vid: &VehicleId) -> Result<&mut SimVehicle, SimulatorError> {
        self.vehicles
            .iter_mut()
            .find(|v| &v.id == vid)
            .ok_or_else(|| SimulatorError::UnknownVehicle(vid.to_string()))
    }

    fn ensure_open(&self) -> Result<(), SimulatorError> {
        if self.open {
            Ok(())
        } else {
            Err(SimulatorError::Closed)
        }
    }
}

impl Simulator for KinematicSimulator {
    fn vehicles(&self) -> Vec<VehicleId> {
        self.vehicles.iter().map(|v| v.id.clone()).collect()
    }

    fn attach_sensor(&mut self, vid: &VehicleId, rid: &str, request: SensorRequest) -> Result<(), SimulatorError> {
        self.ensure_open()?;
        self.vehicle_mut(vid)?.requests.insert(rid.to_string(), request);
        Ok(())
    }

    fn poll(&mut self, vid: &VehicleId) -> Result<VehicleState, SimulatorError> {
        self.ensure_open()?;
        let vehicle = self
            .vehicles
            .iter()
            .find(|v| &v.id == vid)
            .ok_or_else(|| SimulatorError::UnknownVehicle(vid.to_string()))?;

        let mut position = vehicle.position;
        if let Some(noise) = &self.noise {
            position.x += noise.sample(&mut self.rng);
            position.y += noise.sample(&mut self.rng);
        }
        let direction = vehicle.direction();
        Ok(VehicleState {
            tick: self.tick,
            position,
            direction,
            velocity: direction * vehicle.speed,
            steering: vehicle.steering,
            damage: vehicle.damage,
            bbox: vehicle.bbox(),
            lights: vehicle.lights.clone(),
            lidar: vehicle.lidar(&self.environment.obstacles),
        })
    }

    fn step(&mut self, ticks: u32) -> Result<(), SimulatorError> {
        self.ensure_open()?;
        for _ in 0..ticks {
            self.tick += 1;
            for vehicle in &mut self.vehicles {
                vehicle.advance(self.dt, self.tick);
                vehicle.collide(&self.environment.obstacles);
            }
        }
        Ok(())
    }

    fn current_tick(&self) -> u64 {
        self.tick
    }

    fn movement_mode(&self, vid: &VehicleId) -> Option<MovementMode> {
        self.vehicles.iter().find(|v| &v.id == vid).map(|v| v.mode)
    }

    fn control(&mut self, vid: &VehicleId, command: &AvCommand) -> Result<(), SimulatorError> {
        self.ensure_open()?;
        self.vehicle_mut(vid)?.command = command.clone();
        Ok(())
    }

    fn roads(&self) -> Vec<Road> {
        self.environment.roads.clone()
    }

    fn close(&mut self) {
        self.open = false;
    }
}
