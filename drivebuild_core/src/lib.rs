//! DriveBuild Core - Distributed Test Orchestration for Driving Simulations
//!
//! This library coordinates long-running simulation tests across a main
//! application and any number of simulation nodes:
//! 1. **Routing**: node registry, least-loaded dispatch and per-user quotas
//! 2. **Pairing**: a generation-counted rendezvous between AI clients and
//!    simulation ticks
//! 3. **Verdicts**: a runtime verification loop over Kleene-Priest
//!    three-valued criteria

pub mod client;
pub mod criteria;
pub mod dispatch;
pub mod main_app;
pub mod registry;
pub mod rendezvous;
pub mod sensors;
pub mod simnode;
pub mod simulation;
pub mod simulator;
pub mod store;
pub mod testcase;
pub mod verification;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use client::{AiExchangeClient, ClientError, RemoteSidAllocator};
pub use criteria::{EvalContext, Evaluable, Guard, KpValue, LaneTarget, StateCondition};
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher, Status};
pub use main_app::{BoundPorts, MainAppConfig, MainApplication};
pub use registry::{Registration, SimulationRegistry};
pub use rendezvous::{Release, RendezvousBarrier};
pub use sensors::{CarLight, Road, SensorRequest, VehicleState};
pub use simnode::{NodeConfig, NodeError, NodeRequestHandler, SimulationNode};
pub use simulation::Simulation;
pub use simulator::{MovementMode, Simulator, SimulatorError, SimulatorHandle};
pub use store::{SidAllocator, SledTestStore, StoreError, StoreSidAllocator, TestRecord, TestStore, VerificationCycle};
pub use testcase::{LoadError, LoadedTest, Participant, TestCase, TestLoader};
pub use verification::{run_verification, CriteriaEvaluation, Outcome, SimState, Verdict, VerificationConfig};
