//! Dispatch of submissions and routed actions to simulation nodes.

use crate::registry::SimulationRegistry;
use crate::store::{StoreError, TestStore};
use drivebuild_env::multiplexer;
use drivebuild_env::proto::{self, submission_result};
use drivebuild_env::{EnvError, FramedSocket, NodeId, SimulationId, VehicleId};
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// HTTP-equivalent status codes of client replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    TooManyRequests = 429,
    InternalError = 500,
    NotImplemented = 501,
    Unavailable = 503,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Simulations one user may run at the same time
    pub quota: usize,

    /// How long to wait for a node to open a requested side channel
    pub vehicle_channel_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            quota: 2,
            vehicle_channel_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("The user parameter could not be parsed.")]
    BadUser,

    #[error("The request misses the parameter \"{0}\".")]
    MissingParameter(&'static str),

    #[error("The username or password is wrong.")]
    LoginFailed,

    #[error(
        "You´re not allowed to run more than {quota} instances simultaneously (Running simulations: {}).",
        .running.join(", ")
    )]
    QuotaExceeded { quota: usize, running: Vec<String> },

    #[error("There is no simulation node available.")]
    NoNode,

    #[error("Determination of running tests currently unavailable.")]
    RunningTestsUnavailable,

    #[error("There is no simulation with ID \"{0}\".")]
    UnknownSimulation(SimulationId),

    #[error("Simulation node {node} did not open a channel for {sid}/{vid} in time.")]
    VehicleChannel {
        node: NodeId,
        sid: SimulationId,
        vid: VehicleId,
    },

    #[error("The submission was rejected: {0}")]
    Rejected(String),

    #[error("The action \"{0}\" is not implemented.")]
    NotImplemented(String),

    #[error("Simulation node {0} failed: {1}")]
    Node(NodeId, EnvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl DispatchError {
    pub fn status(&self) -> Status {
        match self {
            DispatchError::BadUser
            | DispatchError::MissingParameter(_)
            | DispatchError::UnknownSimulation(_)
            | DispatchError::Rejected(_) => Status::BadRequest,
            DispatchError::LoginFailed => Status::Unauthorized,
            DispatchError::QuotaExceeded { .. } => Status::TooManyRequests,
            DispatchError::NotImplemented(_) => Status::NotImplemented,
            DispatchError::NoNode
            | DispatchError::RunningTestsUnavailable
            | DispatchError::VehicleChannel { .. } => Status::Unavailable,
            DispatchError::Node(..) | DispatchError::Store(_) | DispatchError::Env(_) => Status::InternalError,
        }
    }
}

/// Chooses nodes for submissions and routes actions to the owning node.
pub struct Dispatcher {
    registry: Arc<SimulationRegistry>,
    store: Arc<dyn TestStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<SimulationRegistry>, store: Arc<dyn TestStore>, config: DispatchConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SimulationRegistry> {
        &self.registry
    }

    /// Checks credentials and quota, then starts the tests on the least
    /// loaded node.
    pub async fn submit(
        &self,
        payload: &[u8],
        user: &[u8],
    ) -> Result<HashMap<String, proto::SimulationId>, DispatchError> {
        let parsed: proto::User = proto::decode(user).map_err(|_| DispatchError::BadUser)?;
        if parsed.username.is_empty() {
            return Err(DispatchError::BadUser);
        }
        if !self.store.login_correct(&parsed.username, &parsed.password)? {
            return Err(DispatchError::LoginFailed);
        }

        self.registry.prune_dead().await;
        let running = self.running_tests(&parsed).await?;
        if running.len() >= self.config.quota {
            let mut running: Vec<String> = running.into_keys().collect();
            running.sort();
            info!("{} exceeds the quota with {:?}", parsed.username, running);
            return Err(DispatchError::QuotaExceeded {
                quota: self.config.quota,
                running,
            });
        }

        let node = self.registry.least_loaded().await.ok_or(DispatchError::NoNode)?;
        let control = self.registry.control_socket(&node).await.ok_or(DispatchError::NoNode)?;
        debug!("Dispatching submission of {} to {}", parsed.username, node);

        let reply: proto::SubmissionResult =
            multiplexer::call(&control, "runTests", &[payload.to_vec(), user.to_vec()])
                .await
                .map_err(|e| DispatchError::Node(node.clone(), e))?;
        match reply.outcome {
            Some(submission_result::Outcome::Result(submitted)) => {
                let sids: Vec<SimulationId> = submitted.submissions.values().cloned().map(Into::into).collect();
                self.registry.record_simulations(&node, &sids).await;
                info!("Node {} runs {:?} for {}", node, sids, parsed.username);
                Ok(submitted.submissions)
            }
            Some(submission_result::Outcome::Message(void)) => Err(DispatchError::Rejected(void.message)),
            None => Err(DispatchError::Rejected("empty answer".into())),
        }
    }

    /// Running simulations of a user across all nodes, asked one node at a
    /// time.
    ///
    /// A node that cannot answer makes the whole count unknown; the quota
    /// must not treat it as zero.
    pub async fn running_tests(
        &self,
        user: &proto::User,
    ) -> Result<HashMap<String, proto::SimulationId>, DispatchError> {
        let mut running = HashMap::new();
        let item = user.encode_to_vec();
        for (node, control) in self.registry.control_sockets().await {
            match multiplexer::call::<proto::SubmissionResult>(&control, "runningTests", &[item.clone()]).await {
                Ok(proto::SubmissionResult {
                    outcome: Some(submission_result::Outcome::Result(submitted)),
                }) => running.extend(submitted.submissions),
                Ok(proto::SubmissionResult {
                    outcome: Some(submission_result::Outcome::Message(void)),
                }) if void.message == proto::NO_SIMULATIONS_RUNNING => {}
                Ok(other) => {
                    warn!("Node {} gave no running tests: {:?}", node, other);
                    return Err(DispatchError::RunningTestsUnavailable);
                }
                Err(e) => {
                    warn!("Asking {} for running tests failed: {}", node, e);
                    return Err(DispatchError::RunningTestsUnavailable);
                }
            }
        }
        Ok(running)
    }

    /// Routes an action to the node owning `sid`.
    ///
    /// Vehicle-specific actions travel over a dedicated side channel so a
    /// blocking call never stalls the node's control socket.
    pub async fn forward(
        &self,
        action: &str,
        sid: &SimulationId,
        vid: Option<&VehicleId>,
        items: &[Vec<u8>],
    ) -> Result<Vec<u8>, DispatchError> {
        self.registry.prune_dead().await;
        let node = self
            .registry
            .find_node_for(sid)
            .await
            .ok_or_else(|| DispatchError::UnknownSimulation(sid.clone()))?;

        let socket = match vid {
            Some(vid) => self.vehicle_socket(&node, sid, vid).await?,
            None => self.registry.control_socket(&node).await.ok_or(DispatchError::NoNode)?,
        };
        multiplexer::send_request(&socket, action, items)
            .await
            .map_err(|e| DispatchError::Node(node, e))
    }

    async fn vehicle_socket(
        &self,
        node: &NodeId,
        sid: &SimulationId,
        vid: &VehicleId,
    ) -> Result<Arc<FramedSocket>, DispatchError> {
        if let Some(socket) = self.registry.vehicle_socket(sid, vid).await {
            return Ok(socket);
        }

        let control = self.registry.control_socket(node).await.ok_or(DispatchError::NoNode)?;
        let waiter = self
            .registry
            .expect_vehicle_socket(node)
            .await
            .ok_or(DispatchError::NoNode)?;
        multiplexer::send_request(&control, "requestSocket", &[])
            .await
            .map_err(|e| DispatchError::Node(node.clone(), e))?;

        let unavailable = || DispatchError::VehicleChannel {
            node: node.clone(),
            sid: sid.clone(),
            vid: vid.clone(),
        };
        let socket = tokio::time::timeout(self.config.vehicle_channel_timeout, waiter)
            .await
            .map_err(|_| unavailable())?
            .map_err(|_| unavailable())?;
        self.registry.attach_vehicle_socket(node, sid, vid, socket.clone()).await;
        debug!("Side channel {}/{} on {} established", sid, vid, node);
        Ok(socket)
    }
}
