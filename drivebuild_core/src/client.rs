//! Client library for the main application's client port.

use crate::store::{SidAllocator, StoreError};
use crate::verification::{SimState, Verdict};
use async_trait::async_trait;
use drivebuild_env::multiplexer;
use drivebuild_env::proto::{self, control, submission_result, SimCommandKind};
use drivebuild_env::{EnvError, FramedSocket, FramingConfig, SimulationId, VehicleId};
use prost::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Env(#[from] EnvError),

    /// The main application answered with a non-200 status
    #[error("Request failed with status {status}: {message}")]
    Status { status: u32, message: String },
}

impl ClientError {
    pub fn status(&self) -> Option<u32> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Env(_) => None,
        }
    }
}

/// One connection to the client port.
///
/// `wait_for_simulator_request` blocks the connection until the vehicle's
/// turn, so every AI vehicle uses its own client.
pub struct AiExchangeClient {
    socket: FramedSocket,
}

impl AiExchangeClient {
    pub async fn connect(addr: SocketAddr, framing: FramingConfig) -> Result<Self, ClientError> {
        Ok(Self {
            socket: FramedSocket::connect(addr, framing).await?,
        })
    }

    async fn call(&self, action: &str, items: &[Vec<u8>]) -> Result<Vec<u8>, ClientError> {
        let reply: proto::Reply = multiplexer::call(&self.socket, action, items).await?;
        if reply.status == 200 {
            return Ok(reply.body);
        }
        let message = match proto::decode::<proto::SubmissionResult>(&reply.body) {
            Ok(proto::SubmissionResult {
                outcome: Some(submission_result::Outcome::Message(void)),
            }) => void.message,
            _ => proto::decode::<proto::Void>(&reply.body)
                .map(|void| void.message)
                .unwrap_or_default(),
        };
        Err(ClientError::Status {
            status: reply.status,
            message,
        })
    }

    async fn call_as<M: Message + Default>(&self, action: &str, items: &[Vec<u8>]) -> Result<M, ClientError> {
        let body = self.call(action, items).await?;
        Ok(proto::decode(&body)?)
    }

    /// Submits tests; answers test name to simulation id.
    pub async fn run_tests(
        &self,
        tests: &[u8],
        user: &proto::User,
    ) -> Result<HashMap<String, SimulationId>, ClientError> {
        let result: proto::SubmissionResult = self
            .call_as("runTests", &[tests.to_vec(), user.encode_to_vec()])
            .await?;
        match result.outcome {
            Some(submission_result::Outcome::Result(submitted)) => Ok(submitted
                .submissions
                .into_iter()
                .map(|(name, sid)| (name, sid.into()))
                .collect()),
            Some(submission_result::Outcome::Message(void)) => Err(ClientError::Status {
                status: 400,
                message: void.message,
            }),
            None => Ok(HashMap::new()),
        }
    }

    /// Blocks until the simulation wants this vehicle to act. Anything but
    /// RUNNING means the simulation is over.
    pub async fn wait_for_simulator_request(&self, sid: &SimulationId, vid: &VehicleId) -> Result<SimState, ClientError> {
        let items = [proto::SimulationId::from(sid).encode_to_vec(), proto::VehicleId::from(vid).encode_to_vec()];
        let response: proto::SimStateResponse = self.call_as("waitForSimulatorRequest", &items).await?;
        Ok(response.state().into())
    }

    pub async fn request_data(
        &self,
        sid: &SimulationId,
        vid: &VehicleId,
        request_ids: &[&str],
    ) -> Result<proto::DataResponse, ClientError> {
        let request = proto::DataRequest {
            vid: Some(vid.into()),
            request_ids: request_ids.iter().map(|r| r.to_string()).collect(),
        };
        self.call_as(
            "requestData",
            &[proto::SimulationId::from(sid).encode_to_vec(), request.encode_to_vec()],
        )
        .await
    }

    pub async fn control(&self, sid: &SimulationId, vid: &VehicleId, command: proto::AvCommand) -> Result<String, ClientError> {
        let control = proto::Control {
            vid: Some(vid.into()),
            command: Some(control::Command::Avcommand(command)),
        };
        self.send_control(sid, control).await
    }

    /// Succeeds, fails, cancels or resumes a simulation.
    pub async fn control_sim(&self, sid: &SimulationId, command: SimCommandKind) -> Result<String, ClientError> {
        let control = proto::Control {
            vid: None,
            command: Some(control::Command::SimCommand(proto::SimCommand { command: command as i32 })),
        };
        self.send_control(sid, control).await
    }

    async fn send_control(&self, sid: &SimulationId, control: proto::Control) -> Result<String, ClientError> {
        let void: proto::Void = self
            .call_as("control", &[proto::SimulationId::from(sid).encode_to_vec(), control.encode_to_vec()])
            .await?;
        Ok(void.message)
    }

    pub async fn stop(&self, sid: &SimulationId, verdict: Verdict) -> Result<String, ClientError> {
        let result = proto::TestResult::with_verdict(verdict.into());
        let void: proto::Void = self
            .call_as("stop", &[proto::SimulationId::from(sid).encode_to_vec(), result.encode_to_vec()])
            .await?;
        Ok(void.message)
    }

    pub async fn status(&self, sid: &SimulationId) -> Result<SimState, ClientError> {
        let response: proto::SimStateResponse =
            self.call_as("status", &[proto::SimulationId::from(sid).encode_to_vec()]).await?;
        Ok(response.state().into())
    }

    pub async fn result(&self, sid: &SimulationId) -> Result<Verdict, ClientError> {
        let response: proto::TestResult = self.call_as("result", &[proto::SimulationId::from(sid).encode_to_vec()]).await?;
        Ok(response.result().into())
    }

    pub async fn trace(&self, sid: &SimulationId, vid: Option<&VehicleId>) -> Result<proto::Trace, ClientError> {
        let mut items = vec![proto::SimulationId::from(sid).encode_to_vec()];
        if let Some(vid) = vid {
            items.push(proto::VehicleId::from(vid).encode_to_vec());
        }
        self.call_as("trace", &items).await
    }

    pub async fn running_tests(&self, user: &proto::User) -> Result<HashMap<String, SimulationId>, ClientError> {
        let result: proto::SubmissionResult = self.call_as("runningTests", &[user.encode_to_vec()]).await?;
        Ok(match result.outcome {
            Some(submission_result::Outcome::Result(submitted)) => submitted
                .submissions
                .into_iter()
                .map(|(name, sid)| (name, sid.into()))
                .collect(),
            _ => HashMap::new(),
        })
    }

    pub async fn generate_sid(&self) -> Result<SimulationId, ClientError> {
        let sid: proto::SimulationId = self.call_as("generateSid", &[]).await?;
        Ok(sid.into())
    }
}

/// Asks the main application for simulation ids.
pub struct RemoteSidAllocator {
    client: AiExchangeClient,
}

impl RemoteSidAllocator {
    pub async fn connect(addr: SocketAddr, framing: FramingConfig) -> Result<Self, ClientError> {
        Ok(Self {
            client: AiExchangeClient::connect(addr, framing).await?,
        })
    }
}

#[async_trait]
impl SidAllocator for RemoteSidAllocator {
    async fn generate_sid(&self) -> Result<SimulationId, StoreError> {
        self.client
            .generate_sid()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))
    }
}
