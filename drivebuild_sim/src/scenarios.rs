//! Built-in scenarios covering every way a test can end.

use crate::bundle::TestBundle;
use crate::driver::CruiseDriver;
use crate::kinematics::{Environment, Obstacle, VehicleSetup};
use drivebuild_core::{
    Evaluable, LaneTarget, MovementMode, Participant, Road, SensorRequest, SimState, StateCondition, TestCase, Verdict,
};
use drivebuild_env::VehicleId;
use std::collections::BTreeMap;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// DB-001: scripted acceleration past a speed threshold
    SpeedLimit,

    /// DB-002: precondition violated from the first cycle
    OffRoadStart,

    /// DB-003: scripted drive into an obstacle
    Collision,

    /// DB-004: AI-driven lane keeping up to a waypoint
    LaneKeeping,

    /// DB-005: success never reached, wall-clock budget exhausted
    Endless,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SpeedLimit,
            ScenarioId::OffRoadStart,
            ScenarioId::Collision,
            ScenarioId::LaneKeeping,
            ScenarioId::Endless,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SpeedLimit => "speed_limit",
            ScenarioId::OffRoadStart => "off_road_start",
            ScenarioId::Collision => "collision",
            ScenarioId::LaneKeeping => "lane_keeping",
            ScenarioId::Endless => "endless",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SpeedLimit => "Speeds 5, 8, 12 m/s against a 10 m/s success threshold",
            ScenarioId::OffRoadStart => "Vehicle placed beside the road, precondition requires it on the road",
            ScenarioId::Collision => "Vehicle at 10 m/s heading into an obstacle before its waypoint",
            ScenarioId::LaneKeeping => "AI holds 10 m/s and the lane until the waypoint at 150 m",
            ScenarioId::Endless => "Success threshold out of reach, verification runs into its timeout",
        }
    }

    /// Verdict and status the scenario has to end with.
    pub fn expected(&self) -> (Verdict, SimState) {
        match self {
            ScenarioId::SpeedLimit | ScenarioId::LaneKeeping => (Verdict::Succeeded, SimState::Finished),
            ScenarioId::OffRoadStart => (Verdict::Skipped, SimState::Canceled),
            ScenarioId::Collision => (Verdict::Failed, SimState::Finished),
            ScenarioId::Endless => (Verdict::Unknown, SimState::Timeout),
        }
    }

    /// AI drivers to attach, one per autonomous participant.
    pub fn drivers(&self) -> Vec<(VehicleId, CruiseDriver)> {
        match self {
            ScenarioId::LaneKeeping => vec![(
                ego(),
                CruiseDriver::new(10.0, "speed").keeping_lane("angle"),
            )],
            _ => Vec::new(),
        }
    }

    /// The test bundle submitted for this scenario.
    pub fn bundle(&self) -> TestBundle {
        let mut vehicle = VehicleSetup::new("ego", MovementMode::Manual);
        let mut environment = Environment {
            roads: vec![Road::straight("main", -10.0, 400.0, 0.0, 8.0)],
            ..Default::default()
        };
        let mut test = TestCase {
            name: self.name().to_string(),
            authors: vec!["drivebuild".to_string()],
            steps_per_second: 60,
            ai_frequency: 6,
            precondition: Evaluable::Unknown,
            success: Evaluable::Unknown,
            failure: Evaluable::condition(StateCondition::Damage { participant: ego() }),
            participants: vec![participant(&[("speed", SensorRequest::Speed), ("position", SensorRequest::Position)])],
        };

        match self {
            ScenarioId::SpeedLimit => {
                vehicle.speeds = vec![5.0, 8.0, 12.0];
                test.success = speed_above(10.0);
            }
            ScenarioId::OffRoadStart => {
                vehicle.y = 50.0;
                vehicle.speed = 5.0;
                test.precondition = Evaluable::condition(StateCondition::Lane {
                    participant: ego(),
                    lane: LaneTarget::Road("main".to_string()),
                });
                test.success = speed_above(10.0);
            }
            ScenarioId::Collision => {
                vehicle.speed = 10.0;
                environment.obstacles.push(Obstacle {
                    x: 40.0,
                    y: 0.0,
                    radius: 1.5,
                });
                test.success = waypoint(200.0);
            }
            ScenarioId::LaneKeeping => {
                vehicle.mode = MovementMode::Autonomous;
                vehicle.heading = 3.0;
                test.participants = vec![participant(&[
                    ("speed", SensorRequest::Speed),
                    ("angle", SensorRequest::CarToLaneAngle),
                    ("distance", SensorRequest::RoadCenterDistance),
                ])];
                test.failure = Evaluable::or(vec![
                    test.failure,
                    Evaluable::condition(StateCondition::Lane {
                        participant: ego(),
                        lane: LaneTarget::Offroad,
                    }),
                ]);
                test.success = waypoint(150.0);
            }
            ScenarioId::Endless => {
                vehicle.speed = 5.0;
                test.success = speed_above(50.0);
            }
        }

        TestBundle {
            test,
            environment,
            vehicles: vec![vehicle],
        }
    }
}

fn ego() -> VehicleId {
    VehicleId::new("ego")
}

fn participant(requests: &[(&str, SensorRequest)]) -> Participant {
    Participant {
        id: ego(),
        requests: requests
            .iter()
            .map(|(rid, request)| (rid.to_string(), *request))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn speed_above(limit: f64) -> Evaluable {
    Evaluable::condition(StateCondition::Speed {
        participant: ego(),
        limit,
    })
}

fn waypoint(x: f64) -> Evaluable {
    Evaluable::condition(StateCondition::Waypoint {
        participant: ego(),
        waypoint: format!("wp_{}", x),
        x,
        y: 0.0,
        tolerance: 5.0,
    })
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "speed_limit" | "speedlimit" | "db-001" => Ok(ScenarioId::SpeedLimit),
            "off_road_start" | "offroadstart" | "db-002" => Ok(ScenarioId::OffRoadStart),
            "collision" | "db-003" => Ok(ScenarioId::Collision),
            "lane_keeping" | "lanekeeping" | "db-004" => Ok(ScenarioId::LaneKeeping),
            "endless" | "db-005" => Ok(ScenarioId::Endless),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
