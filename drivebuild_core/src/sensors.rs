//! Vehicle sensor state, named data requests and road geometry.
//!
//! The simulator binding delivers one [`VehicleState`] per vehicle and poll.
//! The node keeps the last polled state in a cache; criteria and AI data
//! requests only ever read that cache, they never trigger a poll.

use drivebuild_env::proto::{self, data};
use geo::{Contains, Coord, EuclideanDistance, Intersects, Line, LineString, Point, Polygon};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Indicator and head lights of a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CarLight {
    LowBeam,
    HighBeam,
    SignalL,
    SignalR,
    SignalWarn,
    FogLights,
}

impl From<CarLight> for proto::CarLight {
    fn from(light: CarLight) -> Self {
        match light {
            CarLight::LowBeam => proto::CarLight::LowBeam,
            CarLight::HighBeam => proto::CarLight::HighBeam,
            CarLight::SignalL => proto::CarLight::SignalL,
            CarLight::SignalR => proto::CarLight::SignalR,
            CarLight::SignalWarn => proto::CarLight::SignalWarn,
            CarLight::FogLights => proto::CarLight::FogLights,
        }
    }
}

/// A road given by its left and right edge polylines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Road {
    pub id: String,
    pub left: Vec<[f64; 2]>,
    pub right: Vec<[f64; 2]>,
}

impl Road {
    /// Creates a straight road along the x axis between `x0` and `x1`.
    pub fn straight(id: impl Into<String>, x0: f64, x1: f64, y_center: f64, width: f64) -> Self {
        let half = width / 2.0;
        Self {
            id: id.into(),
            left: vec![[x0, y_center + half], [x1, y_center + half]],
            right: vec![[x0, y_center - half], [x1, y_center - half]],
        }
    }

    /// Surface of the road: the left edge followed by the reversed right edge.
    pub fn polygon(&self) -> Polygon<f64> {
        let mut ring: Vec<(f64, f64)> = self.left.iter().map(|p| (p[0], p[1])).collect();
        ring.extend(self.right.iter().rev().map(|p| (p[0], p[1])));
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Center line, pairing left and right edge points.
    pub fn center_line(&self) -> LineString<f64> {
        self.left
            .iter()
            .zip(self.right.iter())
            .map(|(l, r)| ((l[0] + r[0]) / 2.0, (l[1] + r[1]) / 2.0))
            .collect::<Vec<_>>()
            .into()
    }

    /// Center line segment closest to `point`.
    fn nearest_segment(&self, point: &Point<f64>) -> Option<(f64, Line<f64>)> {
        self.center_line()
            .lines()
            .map(|line| (point.euclidean_distance(&line), line))
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }

    fn to_proto(&self) -> proto::RoadEdge {
        let points = |edge: &[[f64; 2]]| {
            edge.iter()
                .map(|p| proto::Point { x: p[0], y: p[1] })
                .collect::<Vec<_>>()
        };
        proto::RoadEdge {
            left: points(&self.left),
            right: points(&self.right),
        }
    }
}

/// Last polled state of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// Simulator tick at which this state was polled
    pub tick: u64,

    /// Position [x, y, z] in meters
    pub position: Vector3<f64>,

    /// Unit heading vector
    pub direction: Vector3<f64>,

    /// Velocity [vx, vy, vz] in m/s
    pub velocity: Vector3<f64>,

    /// Steering angle in degrees
    pub steering: f64,

    /// Accumulated damage, zero when intact
    pub damage: f64,

    /// Bounding box corners in the ground plane
    pub bbox: Vec<[f64; 2]>,

    /// Lights currently switched on
    pub lights: Vec<CarLight>,

    /// Lidar ranges in meters
    pub lidar: Vec<f64>,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            tick: 0,
            position: Vector3::zeros(),
            direction: Vector3::x(),
            velocity: Vector3::zeros(),
            steering: 0.0,
            damage: 0.0,
            bbox: Vec::new(),
            lights: Vec::new(),
            lidar: Vec::new(),
        }
    }
}

impl VehicleState {
    /// Speed in m/s.
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    /// Ground-plane position.
    pub fn point(&self) -> Point<f64> {
        Point::new(self.position.x, self.position.y)
    }

    /// Bounding box polygon, if the simulator delivered one.
    pub fn bbox_polygon(&self) -> Option<Polygon<f64>> {
        if self.bbox.len() < 3 {
            return None;
        }
        let ring: Vec<(f64, f64)> = self.bbox.iter().map(|p| (p[0], p[1])).collect();
        Some(Polygon::new(LineString::from(ring), vec![]))
    }

    /// True when the bounding box overlaps the surface of `road`.
    pub fn touches(&self, road: &Road) -> Option<bool> {
        self.bbox_polygon().map(|bbox| bbox.intersects(&road.polygon()))
    }

    /// True when the position lies strictly inside `road`.
    pub fn is_on(&self, road: &Road) -> bool {
        road.polygon().contains(&self.point())
    }

    /// Distance to the closest road center line.
    pub fn road_center_distance(&self, roads: &[Road]) -> Option<f64> {
        let point = self.point();
        roads
            .iter()
            .filter_map(|road| road.nearest_segment(&point))
            .map(|(distance, _)| distance)
            .min_by(f64::total_cmp)
    }

    /// Signed angle in degrees between heading and the nearest center segment.
    pub fn car_to_lane_angle(&self, roads: &[Road]) -> Option<f64> {
        let point = self.point();
        let (_, segment) = roads
            .iter()
            .filter_map(|road| road.nearest_segment(&point))
            .min_by(|a, b| a.0.total_cmp(&b.0))?;
        let Coord { x, y } = segment.delta();
        let lane = y.atan2(x);
        let heading = self.direction.y.atan2(self.direction.x);
        let mut angle = (heading - lane).to_degrees();
        while angle > 180.0 {
            angle -= 360.0;
        }
        while angle < -180.0 {
            angle += 360.0;
        }
        Some(angle)
    }
}

/// Kinds of data an AI client or a criterion can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorRequest {
    Position,
    Speed,
    SteeringAngle,
    Damage,
    BoundingBox,
    RoadEdges,
    Light,
    Lidar,
    RoadCenterDistance,
    CarToLaneAngle,
}

impl SensorRequest {
    /// Answers the request from a cached state.
    pub fn read(&self, state: &VehicleState, roads: &[Road]) -> proto::Data {
        let value = match self {
            SensorRequest::Position => data::Value::Position(proto::Point {
                x: state.position.x,
                y: state.position.y,
            }),
            SensorRequest::Speed => data::Value::Speed(proto::Speed {
                speed: state.speed(),
            }),
            SensorRequest::SteeringAngle => data::Value::Angle(proto::SteeringAngle {
                angle: state.steering,
            }),
            SensorRequest::Damage => data::Value::Damage(proto::Damage {
                is_damaged: state.damage > 0.0,
            }),
            SensorRequest::BoundingBox => data::Value::BoundingBox(proto::BoundingBox {
                corners: state
                    .bbox
                    .iter()
                    .map(|p| proto::Point { x: p[0], y: p[1] })
                    .collect(),
            }),
            SensorRequest::RoadEdges => data::Value::RoadEdges(proto::RoadEdges {
                edges: roads
                    .iter()
                    .map(|road| (road.id.clone(), road.to_proto()))
                    .collect(),
            }),
            SensorRequest::Light => data::Value::Light(proto::Light {
                lights: state
                    .lights
                    .iter()
                    .map(|l| proto::CarLight::from(*l) as i32)
                    .collect(),
            }),
            SensorRequest::Lidar => data::Value::Lidar(proto::Lidar {
                distances: state.lidar.clone(),
            }),
            SensorRequest::RoadCenterDistance => match state.road_center_distance(roads) {
                Some(distance) => data::Value::RoadCenterDistance(proto::RoadCenterDistance { distance }),
                None => return proto::Data::error("There is no road to measure against."),
            },
            SensorRequest::CarToLaneAngle => match state.car_to_lane_angle(roads) {
                Some(angle) => data::Value::CarToLaneAngle(proto::CarToLaneAngle { angle }),
                None => return proto::Data::error("There is no road to measure against."),
            },
        };
        proto::Data { value: Some(value) }
    }
}
