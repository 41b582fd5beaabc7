//! DriveBuild Transport & Environment Layer
//!
//! Everything the orchestration core needs to talk over the wire and to
//! observe time, kept free of any simulation semantics:
//!
//! - **Identifiers**: `SimulationId`, `VehicleId`, `NodeId` newtypes
//! - **Wire messages**: protocol-buffer types in [`proto`]
//! - **Framing**: fixed-width decimal length header + payload ([`transport`])
//! - **RPC**: action/items request and single reply frames ([`multiplexer`])
//! - **Context**: clock, sleep and spawn behind [`DriveBuildContext`]
//!
//! # Example
//!
//! ```ignore
//! use drivebuild_env::{multiplexer, proto, FramedSocket, FramingConfig};
//!
//! async fn ask_status(addr: &str) -> Result<proto::Reply, drivebuild_env::EnvError> {
//!     let socket = FramedSocket::connect(addr, FramingConfig::default()).await?;
//!     let sid = proto::SimulationId::new("1");
//!     multiplexer::call(&socket, "status", &[prost::Message::encode_to_vec(&sid)]).await
//! }
//! ```

mod context;
mod error;
pub mod multiplexer;
pub mod proto;
mod tokio_impl;
pub mod transport;
mod types;

pub use context::DriveBuildContext;
pub use error::EnvError;
pub use multiplexer::{RequestHandler, Request};
pub use tokio_impl::TokioContext;
pub use transport::{FramedSocket, FramingConfig, HEADER_WIDTH, MAX_MESSAGE_SIZE};
pub use types::{NodeId, SimulationId, VehicleId};
