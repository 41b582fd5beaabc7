//! DriveBuild Local Harness
//!
//! Everything needed to run DriveBuild without the external simulator
//! engine and without a web front end:
//!
//! - **Clock**: a virtual-time [`SimContext`]
//! - **Engine**: a seeded, kinematic [`KinematicSimulator`]
//! - **Submissions**: JSON [`TestBundle`]s loaded by the [`BundleLoader`]
//! - **AI**: a cruise and lane-keeping [`CruiseDriver`]
//! - **Cluster**: a main application plus N nodes over localhost TCP
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        LocalCluster                        │
//! │                                                            │
//! │   AI drivers ──client port──► MainApplication              │
//! │                                 │  registry + dispatcher   │
//! │                       node port │                          │
//! │               ┌─────────────────┼─────────────────┐        │
//! │          ┌────▼─────┐      ┌────▼─────┐      ┌────▼─────┐  │
//! │          │ snid_0   │      │ snid_1   │ ...  │ snid_n   │  │
//! │          │ loader + │      │ loader + │      │ loader + │  │
//! │          │ kinematic│      │ kinematic│      │ kinematic│  │
//! │          └──────────┘      └──────────┘      └──────────┘  │
//! │                      shared SimContext                     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use drivebuild_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 2);
//! let result = runner.run(ScenarioId::SpeedLimit).await;
//! assert!(result.passed);
//! ```

mod bundle;
mod cluster;
mod context;
pub mod driver;
mod kinematics;
mod runner;
pub mod scenarios;

pub use bundle::{BundleLoader, TestBundle};
pub use cluster::{ClusterConfig, ClusterError, LocalCluster};
pub use context::SimContext;
pub use driver::{drive, CruiseDriver, DriveSummary};
pub use kinematics::{Environment, KinematicSimulator, Obstacle, VehicleSetup, VEHICLE_LENGTH, VEHICLE_WIDTH};
pub use runner::{ScenarioResult, ScenarioRunner};
