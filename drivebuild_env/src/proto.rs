//! Protocol-buffer messages exchanged between clients, the main application and nodes.
//!
//! Messages are declared with the `prost` derive macros directly, so no build
//! script or `protoc` is needed. Every framed payload on a DriveBuild socket is
//! one of these messages serialized with [`prost::Message::encode_to_vec`].

use crate::EnvError;
use prost::Message;
use std::collections::HashMap;

// ============================================================================
// IDENTIFIERS AND PRIMITIVES
// ============================================================================

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SimulationId {
    #[prost(string, tag = "1")]
    pub sid: String,
}

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct VehicleId {
    #[prost(string, tag = "1")]
    pub vid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VehicleIds {
    #[prost(string, repeated, tag = "1")]
    pub vids: Vec<String>,
}

/// Handshake frame and registration answer on the node port.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimulationNodeId {
    #[prost(string, tag = "1")]
    pub snid: String,
}

/// Item count frame of a request. `-1` encodes "zero items".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Num {
    #[prost(int64, tag = "1")]
    pub num: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bool {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

/// Acknowledgement or error text.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Void {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SimCommandKind {
    Resume = 0,
    Fail = 1,
    Cancel = 2,
    Succeed = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AvCommand {
    #[prost(double, tag = "1")]
    pub accelerate: f64,
    #[prost(double, tag = "2")]
    pub steer: f64,
    #[prost(double, tag = "3")]
    pub brake: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimCommand {
    #[prost(enumeration = "SimCommandKind", tag = "1")]
    pub command: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Control {
    #[prost(message, optional, tag = "1")]
    pub vid: Option<VehicleId>,
    #[prost(oneof = "control::Command", tags = "2, 3")]
    pub command: Option<control::Command>,
}

pub mod control {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        #[prost(message, tag = "2")]
        Avcommand(super::AvCommand),
        #[prost(message, tag = "3")]
        SimCommand(super::SimCommand),
    }
}

// ============================================================================
// STATE AND RESULTS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SimState {
    Running = 0,
    Finished = 1,
    Canceled = 2,
    Errored = 3,
    Timeout = 4,
    Unknown = 5,
}

/// Wire form of a verdict. `Unknown` is the zero value so an empty
/// message never decodes as a success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TestVerdict {
    Unknown = 0,
    Succeeded = 1,
    Failed = 2,
    Skipped = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimStateResponse {
    #[prost(enumeration = "SimState", tag = "1")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestResult {
    #[prost(enumeration = "TestVerdict", tag = "1")]
    pub result: i32,
}

/// Current three-valued evaluation of the criteria, as text.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerificationResult {
    #[prost(string, tag = "1")]
    pub precondition: String,
    #[prost(string, tag = "2")]
    pub failure: String,
    #[prost(string, tag = "3")]
    pub success: String,
}

// ============================================================================
// SENSOR DATA
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataRequest {
    #[prost(message, optional, tag = "1")]
    pub vid: Option<VehicleId>,
    #[prost(string, repeated, tag = "2")]
    pub request_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataResponse {
    #[prost(map = "string, message", tag = "1")]
    pub data: HashMap<String, Data>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CarLight {
    LowBeam = 0,
    HighBeam = 1,
    SignalL = 2,
    SignalR = 3,
    SignalWarn = 4,
    FogLights = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Point {
    #[prost(double, tag = "1")]
    pub x: f64,
    #[prost(double, tag = "2")]
    pub y: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Speed {
    #[prost(double, tag = "1")]
    pub speed: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SteeringAngle {
    #[prost(double, tag = "1")]
    pub angle: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Damage {
    #[prost(bool, tag = "1")]
    pub is_damaged: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoundingBox {
    #[prost(message, repeated, tag = "1")]
    pub corners: Vec<Point>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoadEdge {
    #[prost(message, repeated, tag = "1")]
    pub left: Vec<Point>,
    #[prost(message, repeated, tag = "2")]
    pub right: Vec<Point>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoadEdges {
    #[prost(map = "string, message", tag = "1")]
    pub edges: HashMap<String, RoadEdge>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Light {
    #[prost(enumeration = "CarLight", repeated, tag = "1")]
    pub lights: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lidar {
    #[prost(double, repeated, tag = "1")]
    pub distances: Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoadCenterDistance {
    #[prost(double, tag = "1")]
    pub distance: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CarToLaneAngle {
    #[prost(double, tag = "1")]
    pub angle: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(oneof = "data::Value", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub value: Option<data::Value>,
}

pub mod data {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        Position(super::Point),
        #[prost(message, tag = "2")]
        Speed(super::Speed),
        #[prost(message, tag = "3")]
        Angle(super::SteeringAngle),
        #[prost(message, tag = "4")]
        Damage(super::Damage),
        #[prost(message, tag = "5")]
        BoundingBox(super::BoundingBox),
        #[prost(message, tag = "6")]
        RoadEdges(super::RoadEdges),
        #[prost(message, tag = "7")]
        Light(super::Light),
        #[prost(message, tag = "8")]
        Lidar(super::Lidar),
        #[prost(message, tag = "9")]
        RoadCenterDistance(super::RoadCenterDistance),
        #[prost(message, tag = "10")]
        CarToLaneAngle(super::CarToLaneAngle),
        #[prost(message, tag = "11")]
        Error(super::Void),
    }
}

// ============================================================================
// SUBMISSIONS, TRACES AND CLIENT REPLIES
// ============================================================================

/// Test name to assigned simulation id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Submissions {
    #[prost(map = "string, message", tag = "1")]
    pub submissions: HashMap<String, SimulationId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmissionResult {
    #[prost(oneof = "submission_result::Outcome", tags = "1, 2")]
    pub outcome: Option<submission_result::Outcome>,
}

pub mod submission_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Result(super::Submissions),
        #[prost(message, tag = "2")]
        Message(super::Void),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceEntry {
    #[prost(string, tag = "1")]
    pub vid: String,
    #[prost(uint64, tag = "2")]
    pub tick: u64,
    #[prost(message, optional, tag = "3")]
    pub data: Option<DataResponse>,
    #[prost(int64, tag = "4")]
    pub started_ms: i64,
    #[prost(int64, tag = "5")]
    pub finished_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trace {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<TraceEntry>,
}

/// Envelope of every answer on the main application's client port.
/// `status` carries the HTTP-equivalent code.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

// ============================================================================
// CONSTRUCTORS
// ============================================================================

impl SimulationId {
    pub fn new(sid: impl Into<String>) -> Self {
        Self { sid: sid.into() }
    }
}

impl VehicleId {
    pub fn new(vid: impl Into<String>) -> Self {
        Self { vid: vid.into() }
    }
}

impl Num {
    pub fn new(num: i64) -> Self {
        Self { num }
    }
}

impl Bool {
    pub fn new(value: bool) -> Self {
        Self { value }
    }
}

impl Void {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl SimStateResponse {
    pub fn with_state(state: SimState) -> Self {
        Self {
            state: state as i32,
        }
    }
}

impl TestResult {
    pub fn with_verdict(verdict: TestVerdict) -> Self {
        Self {
            result: verdict as i32,
        }
    }
}

impl Data {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: Some(data::Value::Error(Void::new(message))),
        }
    }
}

/// Message a node answers `runningTests` with when nothing runs for the user.
pub const NO_SIMULATIONS_RUNNING: &str = "No simulations running";

impl SubmissionResult {
    pub fn submitted(submissions: HashMap<String, SimulationId>) -> Self {
        Self {
            outcome: Some(submission_result::Outcome::Result(Submissions { submissions })),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            outcome: Some(submission_result::Outcome::Message(Void::new(message))),
        }
    }
}

impl Reply {
    pub fn new(status: u32, body: &impl Message) -> Self {
        Self {
            status,
            body: body.encode_to_vec(),
        }
    }
}

impl From<&crate::SimulationId> for SimulationId {
    fn from(sid: &crate::SimulationId) -> Self {
        Self::new(sid.as_str())
    }
}

impl From<SimulationId> for crate::SimulationId {
    fn from(sid: SimulationId) -> Self {
        crate::SimulationId::new(sid.sid)
    }
}

impl From<&crate::VehicleId> for VehicleId {
    fn from(vid: &crate::VehicleId) -> Self {
        Self::new(vid.as_str())
    }
}

impl From<VehicleId> for crate::VehicleId {
    fn from(vid: VehicleId) -> Self {
        crate::VehicleId::new(vid.vid)
    }
}

impl From<&crate::NodeId> for SimulationNodeId {
    fn from(snid: &crate::NodeId) -> Self {
        Self {
            snid: snid.as_str().to_string(),
        }
    }
}

/// Decodes one request item or reply payload.
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, EnvError> {
    Ok(M::decode(bytes)?)
}
