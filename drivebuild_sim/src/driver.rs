//! A minimal AI for autonomous participants.
//!
//! The driver holds a target speed and steers against the car-to-lane
//! angle. It is enough to keep a vehicle on a straight road and to exercise
//! the wait / request data / control cycle end to end.

use drivebuild_core::{AiExchangeClient, ClientError, SimState};
use drivebuild_env::proto::{self, data, AvCommand};
use drivebuild_env::{SimulationId, VehicleId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Proportional cruise and lane-keeping controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CruiseDriver {
    /// Speed to hold in m/s
    pub target_speed: f64,

    /// Rid of the vehicle's speed request
    pub speed_request: String,

    /// Rid of the vehicle's car-to-lane-angle request, if any
    #[serde(default)]
    pub angle_request: Option<String>,

    /// Degrees of lane angle that map to full steering
    #[serde(default = "default_steering_range")]
    pub steering_range: f64,
}

fn default_steering_range() -> f64 {
    20.0
}

impl CruiseDriver {
    pub fn new(target_speed: f64, speed_request: &str) -> Self {
        Self {
            target_speed,
            speed_request: speed_request.to_string(),
            angle_request: None,
            steering_range: default_steering_range(),
        }
    }

    pub fn keeping_lane(mut self, angle_request: &str) -> Self {
        self.angle_request = Some(angle_request.to_string());
        self
    }

    /// Rids to ask for every turn.
    pub fn requests(&self) -> Vec<&str> {
        let mut rids = vec![self.speed_request.as_str()];
        rids.extend(self.angle_request.as_deref());
        rids
    }

    /// Derives a command from the data of one turn. Missing or failed
    /// readings leave the corresponding control at rest.
    pub fn command(&self, response: &proto::DataResponse) -> AvCommand {
        let value = |rid: &str| response.data.get(rid).and_then(|d| d.value.as_ref());

        let (accelerate, brake) = match value(&self.speed_request) {
            Some(data::Value::Speed(speed)) if speed.speed < self.target_speed => {
                (((self.target_speed - speed.speed) / 2.0).min(1.0), 0.0)
            }
            Some(data::Value::Speed(speed)) if speed.speed > self.target_speed + 1.0 => (0.0, 0.3),
            _ => (0.0, 0.0),
        };
        let steer = match self.angle_request.as_deref().and_then(value) {
            Some(data::Value::CarToLaneAngle(angle)) => (-angle.angle / self.steering_range).clamp(-1.0, 1.0),
            _ => 0.0,
        };
        AvCommand {
            accelerate,
            steer,
            brake,
        }
    }
}

/// What one driving session amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveSummary {
    /// Turns in which a command was sent
    pub turns: u64,

    /// State reported when the simulation released the vehicle for good
    pub final_state: SimState,
}

/// Drives one vehicle until its simulation ends.
///
/// `client` must not be shared with other vehicles: waiting for a turn
/// blocks the connection.
pub async fn drive(
    client: &AiExchangeClient,
    sid: &SimulationId,
    vid: &VehicleId,
    driver: &CruiseDriver,
) -> Result<DriveSummary, ClientError> {
    let rids = driver.requests();
    let mut turns = 0;
    loop {
        let state = client.wait_for_simulator_request(sid, vid).await?;
        if state != SimState::Running {
            debug!("{}/{} released with {:?} after {} turns", sid, vid, state, turns);
            return Ok(DriveSummary {
                turns,
                final_state: state,
            });
        }

        let response = client.request_data(sid, vid, &rids).await?;
        let command = driver.command(&response);
        match client.control(sid, vid, command).await {
            Ok(_) => turns += 1,
            Err(e @ ClientError::Status { .. }) => warn!("{}/{} command rejected: {}", sid, vid, e),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn response(speed: f64, angle: Option<f64>) -> proto::DataResponse {
        let mut data = HashMap::new();
        data.insert(
            "speed".to_string(),
            proto::Data {
                value: Some(data::Value::Speed(proto::Speed { speed })),
            },
        );
        if let Some(angle) = angle {
            data.insert(
                "angle".to_string(),
                proto::Data {
                    value: Some(data::Value::CarToLaneAngle(proto::CarToLaneAngle { angle })),
                },
            );
        }
        proto::DataResponse { data }
    }

    #[test]
    fn test_accelerates_below_target() {
        let driver = CruiseDriver::new(10.0, "speed");
        let command = driver.command(&response(0.0, None));
        assert_relative_eq!(command.accelerate, 1.0);
        assert_eq!(command.brake, 0.0);

        let gentle = driver.command(&response(9.0, None));
        assert_relative_eq!(gentle.accelerate, 0.5);
    }

    #[test]
    fn test_brakes_well_above_target() {
        let driver = CruiseDriver::new(10.0, "speed");
        let command = driver.command(&response(12.0, None));
        assert_eq!(command.accelerate, 0.0);
        assert!(command.brake > 0.0);
        assert_eq!(driver.command(&response(10.5, None)).brake, 0.0);
    }

    #[test]
    fn test_steers_against_lane_angle() {
        let driver = CruiseDriver::new(10.0, "speed").keeping_lane("angle");
        assert_eq!(driver.requests(), vec!["speed", "angle"]);
        assert_relative_eq!(driver.command(&response(10.0, Some(5.0))).steer, -0.25);
        assert_relative_eq!(driver.command(&response(10.0, Some(-90.0))).steer, 1.0);
    }

    #[test]
    fn test_missing_data_rests() {
        let driver = CruiseDriver::new(10.0, "speed").keeping_lane("angle");
        let mut response = response(0.0, None);
        response
            .data
            .insert("speed".into(), proto::Data::error("There is no request with ID \"speed\"."));
        let command = driver.command(&response);
        assert_eq!((command.accelerate, command.steer, command.brake), (0.0, 0.0, 0.0));
    }
}
