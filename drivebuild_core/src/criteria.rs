//! Kleene-Priest three-valued criteria.
//!
//! A test case carries three criteria trees: precondition, success and
//! failure. Each tree is an [`Evaluable`] built once at load time and
//! re-evaluated every verification cycle against the cached sensor data of
//! that cycle. Evaluation is a pure function of an [`EvalContext`].
//!
//! ```text
//!                 And
//!              /   |    \
//!        Speed   Not    Validation(guard = Time[0..200])
//!                 |           |
//!              Damage       Lane(offroad)
//! ```
//!
//! Every state condition answers UNKNOWN while the simulation is not
//! running or while the data it needs has not been polled yet.

use crate::sensors::{CarLight, Road, SensorRequest, VehicleState};
use drivebuild_env::VehicleId;
use geo::{Contains, Intersects, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use thiserror::Error;

// ============================================================================
// KLEENE-PRIEST VALUES
// ============================================================================

/// A truth value of Kleene-Priest logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KpValue {
    True,
    False,
    Unknown,
}

impl KpValue {
    pub fn from_bool(value: bool) -> Self {
        if value {
            KpValue::True
        } else {
            KpValue::False
        }
    }

    pub fn is_true(self) -> bool {
        self == KpValue::True
    }

    pub fn is_false(self) -> bool {
        self == KpValue::False
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KpValue::True => "TRUE",
            KpValue::False => "FALSE",
            KpValue::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for KpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<bool> for KpValue {
    fn from(value: bool) -> Self {
        KpValue::from_bool(value)
    }
}

impl BitAnd for KpValue {
    type Output = KpValue;

    fn bitand(self, rhs: KpValue) -> KpValue {
        match (self, rhs) {
            (KpValue::False, _) | (_, KpValue::False) => KpValue::False,
            (KpValue::Unknown, _) | (_, KpValue::Unknown) => KpValue::Unknown,
            _ => KpValue::True,
        }
    }
}

impl BitOr for KpValue {
    type Output = KpValue;

    fn bitor(self, rhs: KpValue) -> KpValue {
        match (self, rhs) {
            (KpValue::True, _) | (_, KpValue::True) => KpValue::True,
            (KpValue::Unknown, _) | (_, KpValue::Unknown) => KpValue::Unknown,
            _ => KpValue::False,
        }
    }
}

impl Not for KpValue {
    type Output = KpValue;

    fn not(self) -> KpValue {
        match self {
            KpValue::True => KpValue::False,
            KpValue::False => KpValue::True,
            KpValue::Unknown => KpValue::Unknown,
        }
    }
}

// ============================================================================
// EVALUATION CONTEXT
// ============================================================================

/// Everything a criterion may look at during one verification cycle.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Whether the simulation is still running
    pub running: bool,

    /// Current simulator tick
    pub tick: u64,

    /// Last polled state per vehicle
    pub vehicles: &'a HashMap<VehicleId, VehicleState>,

    /// Road geometry of the scenario
    pub roads: &'a [Road],
}

impl<'a> EvalContext<'a> {
    fn vehicle(&self, vid: &VehicleId) -> Option<&'a VehicleState> {
        self.vehicles.get(vid)
    }
}

/// Rejected criterion parameters.
#[derive(Debug, Error, PartialEq)]
pub enum CriteriaError {
    #[error("Invalid criterion parameter: {0}")]
    InvalidParameter(String),
}

// ============================================================================
// STATE CONDITIONS
// ============================================================================

/// Target of a lane condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaneTarget {
    /// Not touching any road
    Offroad,
    /// Touching the road with this id
    Road(String),
}

/// A predicate over the state of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "camelCase")]
pub enum StateCondition {
    /// Within `tolerance` meters of (x, y)
    Position {
        participant: VehicleId,
        x: f64,
        y: f64,
        tolerance: f64,
    },
    /// Inside the polygon
    Area {
        participant: VehicleId,
        points: Vec<[f64; 2]>,
    },
    /// Bounding box overlaps the lane, or no road for `Offroad`
    Lane {
        participant: VehicleId,
        lane: LaneTarget,
    },
    /// Faster than `limit` m/s
    #[serde(rename_all = "camelCase")]
    Speed { participant: VehicleId, limit: f64 },
    /// Any damage at all
    Damage { participant: VehicleId },
    /// Within `max_distance` meters of `other`
    #[serde(rename_all = "camelCase")]
    Distance {
        participant: VehicleId,
        other: VehicleId,
        max_distance: f64,
    },
    /// The light is switched on
    Light {
        participant: VehicleId,
        light: CarLight,
    },
    /// Within the waypoint's tolerance
    Waypoint {
        participant: VehicleId,
        waypoint: String,
        x: f64,
        y: f64,
        tolerance: f64,
    },
}

impl StateCondition {
    pub fn participant(&self) -> &VehicleId {
        match self {
            StateCondition::Position { participant, .. }
            | StateCondition::Area { participant, .. }
            | StateCondition::Lane { participant, .. }
            | StateCondition::Speed { participant, .. }
            | StateCondition::Damage { participant }
            | StateCondition::Distance { participant, .. }
            | StateCondition::Light { participant, .. }
            | StateCondition::Waypoint { participant, .. } => participant,
        }
    }

    /// Sensor requests this condition reads from.
    pub fn requests(&self) -> Vec<(VehicleId, SensorRequest)> {
        let own = |request| vec![(self.participant().clone(), request)];
        match self {
            StateCondition::Position { .. }
            | StateCondition::Area { .. }
            | StateCondition::Waypoint { .. } => own(SensorRequest::Position),
            StateCondition::Lane { .. } => own(SensorRequest::BoundingBox),
            StateCondition::Speed { .. } => own(SensorRequest::Speed),
            StateCondition::Damage { .. } => own(SensorRequest::Damage),
            StateCondition::Light { .. } => own(SensorRequest::Light),
            StateCondition::Distance { participant, other, .. } => vec![
                (participant.clone(), SensorRequest::Position),
                (other.clone(), SensorRequest::Position),
            ],
        }
    }

    pub fn validate(&self) -> Result<(), CriteriaError> {
        let non_negative = |name: &str, value: f64| {
            if value >= 0.0 {
                Ok(())
            } else {
                Err(CriteriaError::InvalidParameter(format!(
                    "{} must not be negative, got {}",
                    name, value
                )))
            }
        };
        match self {
            StateCondition::Position { tolerance, .. } | StateCondition::Waypoint { tolerance, .. } => {
                non_negative("tolerance", *tolerance)
            }
            StateCondition::Speed { limit, .. } => non_negative("speed limit", *limit),
            StateCondition::Distance { max_distance, .. } => non_negative("max distance", *max_distance),
            StateCondition::Area { points, .. } if points.len() < 3 => Err(
                CriteriaError::InvalidParameter(format!("area needs 3 points, got {}", points.len())),
            ),
            _ => Ok(()),
        }
    }

    pub fn eval(&self, ctx: &EvalContext<'_>) -> KpValue {
        if !ctx.running {
            return KpValue::Unknown;
        }
        let Some(state) = ctx.vehicle(self.participant()) else {
            return KpValue::Unknown;
        };

        match self {
            StateCondition::Position { x, y, tolerance, .. }
            | StateCondition::Waypoint { x, y, tolerance, .. } => {
                let dx = state.position.x - x;
                let dy = state.position.y - y;
                KpValue::from_bool(dx.hypot(dy) <= *tolerance)
            }
            StateCondition::Area { points, .. } => {
                let ring: Vec<(f64, f64)> = points.iter().map(|p| (p[0], p[1])).collect();
                let area = Polygon::new(LineString::from(ring), vec![]);
                KpValue::from_bool(area.contains(&Point::new(state.position.x, state.position.y)))
            }
            StateCondition::Lane { lane, .. } => {
                let Some(bbox) = state.bbox_polygon() else {
                    return KpValue::Unknown;
                };
                match lane {
                    LaneTarget::Offroad => {
                        KpValue::from_bool(!ctx.roads.iter().any(|r| bbox.intersects(&r.polygon())))
                    }
                    LaneTarget::Road(id) => match ctx.roads.iter().find(|r| &r.id == id) {
                        Some(road) => KpValue::from_bool(bbox.intersects(&road.polygon())),
                        None => KpValue::Unknown,
                    },
                }
            }
            StateCondition::Speed { limit, .. } => KpValue::from_bool(state.speed() > *limit),
            StateCondition::Damage { .. } => KpValue::from_bool(state.damage > 0.0),
            StateCondition::Distance { other, max_distance, .. } => match ctx.vehicle(other) {
                Some(other) => {
                    let distance = (state.position - other.position).xy().norm();
                    KpValue::from_bool(distance <= *max_distance)
                }
                None => KpValue::Unknown,
            },
            StateCondition::Light { light, .. } => KpValue::from_bool(state.lights.contains(light)),
        }
    }
}

// ============================================================================
// VALIDATION GUARDS
// ============================================================================

/// Guard of a validation constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "guard", rename_all = "camelCase")]
pub enum Guard {
    /// Holds while the wrapped state condition is TRUE
    State { condition: StateCondition },
    /// Holds for ticks in `from_tick..=to_tick`
    #[serde(rename_all = "camelCase")]
    Time { from_tick: u64, to_tick: u64 },
}

impl Guard {
    pub fn eval(&self, ctx: &EvalContext<'_>) -> KpValue {
        match self {
            Guard::State { condition } => condition.eval(ctx),
            Guard::Time { from_tick, to_tick } => {
                if !ctx.running {
                    return KpValue::Unknown;
                }
                KpValue::from_bool(*from_tick <= ctx.tick && ctx.tick <= *to_tick)
            }
        }
    }
}

// ============================================================================
// EVALUABLE TREE
// ============================================================================

/// A criteria tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Evaluable {
    /// Absent criterion; always UNKNOWN
    #[default]
    Unknown,
    Condition(StateCondition),
    /// Inner tree is only checked while the guard is TRUE
    Validation { guard: Guard, inner: Box<Evaluable> },
    And { operands: Vec<Evaluable> },
    Or { operands: Vec<Evaluable> },
    Not { operand: Box<Evaluable> },
}

impl Evaluable {
    pub fn condition(condition: StateCondition) -> Self {
        Evaluable::Condition(condition)
    }

    pub fn validation(guard: Guard, inner: Evaluable) -> Self {
        Evaluable::Validation {
            guard,
            inner: Box::new(inner),
        }
    }

    pub fn and(operands: Vec<Evaluable>) -> Self {
        Evaluable::And { operands }
    }

    pub fn or(operands: Vec<Evaluable>) -> Self {
        Evaluable::Or { operands }
    }

    pub fn negate(operand: Evaluable) -> Self {
        Evaluable::Not {
            operand: Box::new(operand),
        }
    }

    /// Evaluates the tree bottom-up.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> KpValue {
        match self {
            Evaluable::Unknown => KpValue::Unknown,
            Evaluable::Condition(condition) => condition.eval(ctx),
            Evaluable::Validation { guard, inner } => match guard.eval(ctx) {
                KpValue::True => inner.eval(ctx),
                _ => KpValue::Unknown,
            },
            Evaluable::And { operands } => operands
                .iter()
                .fold(KpValue::True, |acc, operand| acc & operand.eval(ctx)),
            Evaluable::Or { operands } => operands
                .iter()
                .fold(KpValue::False, |acc, operand| acc | operand.eval(ctx)),
            Evaluable::Not { operand } => !operand.eval(ctx),
        }
    }

    /// All sensor requests read anywhere in the tree.
    pub fn requests(&self) -> Vec<(VehicleId, SensorRequest)> {
        let mut out = Vec::new();
        self.collect_requests(&mut out);
        out
    }

    fn collect_requests(&self, out: &mut Vec<(VehicleId, SensorRequest)>) {
        match self {
            Evaluable::Unknown => {}
            Evaluable::Condition(condition) => out.extend(condition.requests()),
            Evaluable::Validation { guard, inner } => {
                if let Guard::State { condition } = guard {
                    out.extend(condition.requests());
                }
                inner.collect_requests(out);
            }
            Evaluable::And { operands } | Evaluable::Or { operands } => {
                for operand in operands {
                    operand.collect_requests(out);
                }
            }
            Evaluable::Not { operand } => operand.collect_requests(out),
        }
    }

    /// Checks every condition's parameters.
    pub fn validate(&self) -> Result<(), CriteriaError> {
        match self {
            Evaluable::Unknown => Ok(()),
            Evaluable::Condition(condition) => condition.validate(),
            Evaluable::Validation { guard, inner } => {
                match guard {
                    Guard::State { condition } => condition.validate()?,
                    Guard::Time { from_tick, to_tick } if from_tick > to_tick => {
                        return Err(CriteriaError::InvalidParameter(format!(
                            "time window {}..{} is empty",
                            from_tick, to_tick
                        )))
                    }
                    Guard::Time { .. } => {}
                }
                inner.validate()
            }
            Evaluable::And { operands } | Evaluable::Or { operands } => {
                operands.iter().try_for_each(Evaluable::validate)
            }
            Evaluable::Not { operand } => operand.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use proptest::prelude::*;

    const ALL: [KpValue; 3] = [KpValue::True, KpValue::False, KpValue::Unknown];

    fn kp() -> impl Strategy<Value = KpValue> {
        prop_oneof![Just(KpValue::True), Just(KpValue::False), Just(KpValue::Unknown)]
    }

    fn ego() -> VehicleId {
        VehicleId::new("ego")
    }

    fn vehicles(entries: &[(&str, VehicleState)]) -> HashMap<VehicleId, VehicleState> {
        entries
            .iter()
            .map(|(vid, state)| (VehicleId::new(*vid), state.clone()))
            .collect()
    }

    fn moving(x: f64, y: f64, speed: f64) -> VehicleState {
        VehicleState {
            position: Vector3::new(x, y, 0.0),
            velocity: Vector3::new(speed, 0.0, 0.0),
            bbox: vec![[x - 2.0, y - 1.0], [x + 2.0, y - 1.0], [x + 2.0, y + 1.0], [x - 2.0, y + 1.0]],
            ..Default::default()
        }
    }

    fn ctx<'a>(vehicles: &'a HashMap<VehicleId, VehicleState>, roads: &'a [Road]) -> EvalContext<'a> {
        EvalContext {
            running: true,
            tick: 10,
            vehicles,
            roads,
        }
    }

    fn speed_over(limit: f64) -> Evaluable {
        Evaluable::condition(StateCondition::Speed {
            participant: ego(),
            limit,
        })
    }

    #[test]
    fn test_truth_table() {
        use KpValue::*;
        let and = [
            (True, True, True),
            (True, False, False),
            (True, Unknown, Unknown),
            (False, Unknown, False),
            (Unknown, Unknown, Unknown),
            (False, False, False),
        ];
        for (a, b, expected) in and {
            assert_eq!(a & b, expected, "{} AND {}", a, b);
        }
        let or = [
            (True, Unknown, True),
            (False, Unknown, Unknown),
            (False, False, False),
            (Unknown, Unknown, Unknown),
            (True, False, True),
        ];
        for (a, b, expected) in or {
            assert_eq!(a | b, expected, "{} OR {}", a, b);
        }
        assert_eq!(!Unknown, Unknown);
        assert_eq!(!True, False);
    }

    proptest! {
        #[test]
        fn prop_and_or_commute(a in kp(), b in kp()) {
            prop_assert_eq!(a & b, b & a);
            prop_assert_eq!(a | b, b | a);
        }

        #[test]
        fn prop_de_morgan(a in kp(), b in kp()) {
            prop_assert_eq!(!(a & b), !a | !b);
            prop_assert_eq!(!(a | b), !a & !b);
        }

        #[test]
        fn prop_false_dominates_and_true_dominates_or(a in kp()) {
            prop_assert_eq!(a & KpValue::False, KpValue::False);
            prop_assert_eq!(a | KpValue::True, KpValue::True);
        }

        #[test]
        fn prop_not_is_involution(a in kp()) {
            prop_assert_eq!(!!a, a);
        }
    }

    #[test]
    fn test_connectives_over_lists() {
        let cars = vehicles(&[("ego", moving(0.0, 0.0, 12.0))]);
        let ctx = ctx(&cars, &[]);

        let all = Evaluable::and(vec![speed_over(10.0), speed_over(5.0), Evaluable::Unknown]);
        assert_eq!(all.eval(&ctx), KpValue::Unknown);

        let any = Evaluable::or(vec![speed_over(20.0), Evaluable::Unknown, speed_over(10.0)]);
        assert_eq!(any.eval(&ctx), KpValue::True);

        let none = Evaluable::and(vec![speed_over(20.0), Evaluable::Unknown]);
        assert_eq!(none.eval(&ctx), KpValue::False);

        assert_eq!(Evaluable::and(vec![]).eval(&ctx), KpValue::True);
        assert_eq!(Evaluable::or(vec![]).eval(&ctx), KpValue::False);
        assert_eq!(Evaluable::negate(speed_over(20.0)).eval(&ctx), KpValue::True);
        for value in ALL {
            assert_eq!(!!value, value);
        }
    }

    #[test]
    fn test_conditions_unknown_when_not_running_or_unpolled() {
        let cars = vehicles(&[("ego", moving(0.0, 0.0, 12.0))]);
        let stopped = EvalContext {
            running: false,
            ..ctx(&cars, &[])
        };
        assert_eq!(speed_over(10.0).eval(&stopped), KpValue::Unknown);

        let empty = HashMap::new();
        assert_eq!(speed_over(10.0).eval(&ctx(&empty, &[])), KpValue::Unknown);
    }

    #[test]
    fn test_speed_is_strictly_greater() {
        let cars = vehicles(&[("ego", moving(0.0, 0.0, 10.0))]);
        assert_eq!(speed_over(10.0).eval(&ctx(&cars, &[])), KpValue::False);
        assert_eq!(speed_over(9.9).eval(&ctx(&cars, &[])), KpValue::True);
    }

    #[test]
    fn test_position_and_waypoint() {
        let cars = vehicles(&[("ego", moving(3.0, 4.0, 0.0))]);
        let ctx = ctx(&cars, &[]);
        let at = |tolerance| StateCondition::Position {
            participant: ego(),
            x: 0.0,
            y: 0.0,
            tolerance,
        };
        assert_eq!(at(5.0).eval(&ctx), KpValue::True);
        assert_eq!(at(4.9).eval(&ctx), KpValue::False);

        let waypoint = StateCondition::Waypoint {
            participant: ego(),
            waypoint: "wp_goal".into(),
            x: 3.0,
            y: 5.0,
            tolerance: 1.5,
        };
        assert_eq!(waypoint.eval(&ctx), KpValue::True);
    }

    #[test]
    fn test_area() {
        let cars = vehicles(&[("ego", moving(5.0, 5.0, 0.0))]);
        let ctx = ctx(&cars, &[]);
        let inside = StateCondition::Area {
            participant: ego(),
            points: vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
        };
        let outside = StateCondition::Area {
            participant: ego(),
            points: vec![[20.0, 0.0], [30.0, 0.0], [30.0, 10.0]],
        };
        assert_eq!(inside.eval(&ctx), KpValue::True);
        assert_eq!(outside.eval(&ctx), KpValue::False);
    }

    #[test]
    fn test_lane_and_offroad() {
        let roads = vec![Road::straight("main", 0.0, 100.0, 0.0, 8.0)];
        let on_road = vehicles(&[("ego", moving(50.0, 0.0, 0.0))]);
        let off_road = vehicles(&[("ego", moving(50.0, 30.0, 0.0))]);
        let lane = |target| StateCondition::Lane {
            participant: ego(),
            lane: target,
        };

        assert_eq!(lane(LaneTarget::Road("main".into())).eval(&ctx(&on_road, &roads)), KpValue::True);
        assert_eq!(lane(LaneTarget::Offroad).eval(&ctx(&on_road, &roads)), KpValue::False);
        assert_eq!(lane(LaneTarget::Offroad).eval(&ctx(&off_road, &roads)), KpValue::True);
        assert_eq!(lane(LaneTarget::Road("side".into())).eval(&ctx(&on_road, &roads)), KpValue::Unknown);
    }

    #[test]
    fn test_distance_damage_light() {
        let mut ego_state = moving(0.0, 0.0, 0.0);
        ego_state.damage = 0.5;
        ego_state.lights = vec![CarLight::SignalR];
        let cars = vehicles(&[("ego", ego_state), ("other", moving(6.0, 8.0, 0.0))]);
        let ctx = ctx(&cars, &[]);

        let near = |other: &str, max_distance| StateCondition::Distance {
            participant: ego(),
            other: VehicleId::new(other),
            max_distance,
        };
        assert_eq!(near("other", 10.0).eval(&ctx), KpValue::True);
        assert_eq!(near("other", 9.0).eval(&ctx), KpValue::False);
        assert_eq!(near("ghost", 9.0).eval(&ctx), KpValue::Unknown);

        assert_eq!(StateCondition::Damage { participant: ego() }.eval(&ctx), KpValue::True);
        let light = |light| StateCondition::Light {
            participant: ego(),
            light,
        };
        assert_eq!(light(CarLight::SignalR).eval(&ctx), KpValue::True);
        assert_eq!(light(CarLight::SignalL).eval(&ctx), KpValue::False);
    }

    #[test]
    fn test_validation_constraint_guards() {
        let cars = vehicles(&[("ego", moving(0.0, 0.0, 30.0))]);
        let inside_window = ctx(&cars, &[]);
        let after_window = EvalContext {
            tick: 500,
            ..inside_window
        };

        let constraint = Evaluable::validation(
            Guard::Time {
                from_tick: 0,
                to_tick: 100,
            },
            speed_over(25.0),
        );
        assert_eq!(constraint.eval(&inside_window), KpValue::True);
        assert_eq!(constraint.eval(&after_window), KpValue::Unknown);

        let guarded_by_state = Evaluable::validation(
            Guard::State {
                condition: StateCondition::Damage { participant: ego() },
            },
            speed_over(25.0),
        );
        assert_eq!(guarded_by_state.eval(&inside_window), KpValue::Unknown);
    }

    #[test]
    fn test_requests_cover_whole_tree() {
        let tree = Evaluable::and(vec![
            speed_over(10.0),
            Evaluable::negate(Evaluable::condition(StateCondition::Distance {
                participant: ego(),
                other: VehicleId::new("other"),
                max_distance: 5.0,
            })),
        ]);
        let requests = tree.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.contains(&(ego(), SensorRequest::Speed)));
        assert!(requests.contains(&(VehicleId::new("other"), SensorRequest::Position)));
    }

    #[test]
    fn test_validate_rejects_negative_parameters() {
        assert!(speed_over(-1.0).validate().is_err());
        let bad_window = Evaluable::validation(
            Guard::Time {
                from_tick: 10,
                to_tick: 5,
            },
            Evaluable::Unknown,
        );
        assert!(bad_window.validate().is_err());
        assert!(Evaluable::and(vec![speed_over(3.0)]).validate().is_ok());
    }

    #[test]
    fn test_tree_from_json() {
        let json = r#"{
            "type": "or",
            "operands": [
                {"type": "condition", "condition": "speed", "participant": "ego", "limit": 10.0},
                {"type": "not", "operand": {"type": "unknown"}}
            ]
        }"#;
        let tree: Evaluable = serde_json::from_str(json).unwrap();
        assert_eq!(tree, Evaluable::or(vec![speed_over(10.0), Evaluable::negate(Evaluable::Unknown)]));
    }
}
