//! Main application: node registration port and client port.
//!
//! ```text
//!  simulation nodes ──► node port ──► SimulationRegistry
//!                                          ▲
//!  AI clients / web ──► client port ──► Dispatcher ──► owning node
//! ```
//!
//! Every answer on the client port is a `Reply{status, body}`.

use crate::dispatch::{DispatchConfig, DispatchError, Dispatcher, Status};
use crate::registry::{read_hello, Registration, SimulationRegistry};
use crate::store::TestStore;
use crate::verification::{SimState, Verdict};
use async_trait::async_trait;
use drivebuild_env::multiplexer::{self, RequestHandler};
use drivebuild_env::proto::{self, control};
use drivebuild_env::{DriveBuildContext, EnvError, FramedSocket, FramingConfig, SimulationId, VehicleId};
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MainAppConfig {
    /// Address nodes register at
    pub node_addr: SocketAddr,

    /// Address AI clients and the web layer talk to
    pub client_addr: SocketAddr,

    /// Time a new connection has to send its hello frame
    pub hello_timeout: Duration,

    pub framing: FramingConfig,

    pub dispatch: DispatchConfig,
}

impl Default for MainAppConfig {
    fn default() -> Self {
        Self {
            node_addr: SocketAddr::from(([0, 0, 0, 0], 5004)),
            client_addr: SocketAddr::from(([0, 0, 0, 0], 5003)),
            hello_timeout: Duration::from_secs(5),
            framing: FramingConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Addresses actually bound, useful when the config asks for port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPorts {
    pub node_addr: SocketAddr,
    pub client_addr: SocketAddr,
}

pub struct MainApplication<Ctx: DriveBuildContext> {
    ctx: Arc<Ctx>,
    config: MainAppConfig,
    store: Arc<dyn TestStore>,
    registry: Arc<SimulationRegistry>,
    dispatcher: Dispatcher,
}

impl<Ctx: DriveBuildContext> MainApplication<Ctx> {
    pub fn new(ctx: Arc<Ctx>, store: Arc<dyn TestStore>, config: MainAppConfig) -> Self {
        let registry = Arc::new(SimulationRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), store.clone(), config.dispatch.clone());
        Self {
            ctx,
            config,
            store,
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<SimulationRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Binds both ports and serves them in background tasks.
    pub async fn listen(self: &Arc<Self>) -> Result<BoundPorts, EnvError> {
        let nodes = TcpListener::bind(self.config.node_addr).await?;
        let clients = TcpListener::bind(self.config.client_addr).await?;
        let ports = BoundPorts {
            node_addr: nodes.local_addr()?,
            client_addr: clients.local_addr()?,
        };
        info!(
            "Main application listening: nodes on {}, clients on {}",
            ports.node_addr, ports.client_addr
        );

        let app = self.clone();
        self.ctx.spawn("node-port", async move { app.accept_nodes(nodes).await });
        let app = self.clone();
        self.ctx.spawn("client-port", async move { app.accept_clients(clients).await });
        Ok(ports)
    }

    async fn accept_nodes(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accepting node connection failed: {}", e);
                    continue;
                }
            };
            let socket = match FramedSocket::new(stream, self.config.framing.clone()) {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!("Dropping node connection {}: {}", peer, e);
                    continue;
                }
            };
            let app = self.clone();
            self.ctx.spawn("node-hello", async move {
                if let Err(e) = app.welcome(socket).await {
                    warn!("Node connection {} rejected: {}", peer, e);
                }
            });
        }
    }

    async fn welcome(&self, socket: Arc<FramedSocket>) -> Result<(), EnvError> {
        let timeout = self.config.hello_timeout;
        let hello = tokio::time::timeout(timeout, read_hello(&socket))
            .await
            .map_err(|_| EnvError::Timeout(timeout.as_millis() as u64))??;
        match self.registry.register(socket, &hello).await? {
            Registration::Node(id) => debug!("Node {} joined", id),
            Registration::VehicleChannel(id) => debug!("Side channel of {} joined", id),
            Registration::Superfluous => {}
        }
        Ok(())
    }

    async fn accept_clients(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accepting client connection failed: {}", e);
                    continue;
                }
            };
            let socket = match FramedSocket::new(stream, self.config.framing.clone()) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Dropping client connection {}: {}", peer, e);
                    continue;
                }
            };
            debug!("Client {} connected", peer);
            let handler = ClientRequestHandler { app: self.clone() };
            self.ctx.spawn("client", async move {
                if let Err(e) = multiplexer::process_requests(&socket, &handler).await {
                    warn!("Client {} dropped: {}", peer, e);
                }
            });
        }
    }

    /// Status of a simulation, falling back to the persisted record once no
    /// node knows it.
    async fn status(&self, sid: &SimulationId, items: &[Vec<u8>]) -> Result<Vec<u8>, DispatchError> {
        match self.dispatcher.forward("status", sid, None, items).await {
            Err(DispatchError::UnknownSimulation(_)) => {
                let state = self.store.test(sid)?.map_or(SimState::Unknown, |r| r.status);
                Ok(proto::SimStateResponse::with_state(state.into()).encode_to_vec())
            }
            other => other,
        }
    }

    async fn result(&self, sid: &SimulationId, items: &[Vec<u8>]) -> Result<Vec<u8>, DispatchError> {
        match self.dispatcher.forward("result", sid, None, items).await {
            Err(DispatchError::UnknownSimulation(_)) => {
                let verdict = self.store.test(sid)?.map_or(Verdict::Unknown, |r| r.result);
                Ok(proto::TestResult::with_verdict(verdict.into()).encode_to_vec())
            }
            other => other,
        }
    }

    async fn handle_client(&self, action: &str, items: &[Vec<u8>]) -> Result<Vec<u8>, DispatchError> {
        let sid = || -> Result<SimulationId, DispatchError> {
            let raw = items.first().ok_or(DispatchError::MissingParameter("sid"))?;
            Ok(proto::decode::<proto::SimulationId>(raw)?.into())
        };
        let second = |name: &'static str| items.get(1).ok_or(DispatchError::MissingParameter(name));

        match action {
            "runTests" => {
                let payload = items.first().ok_or(DispatchError::MissingParameter("tests"))?;
                let user = items.get(1).ok_or(DispatchError::BadUser)?;
                let submitted = self.dispatcher.submit(payload, user).await?;
                Ok(proto::SubmissionResult::submitted(submitted).encode_to_vec())
            }
            "waitForSimulatorRequest" => {
                let vid: VehicleId = proto::decode::<proto::VehicleId>(second("vid")?)?.into();
                self.dispatcher.forward(action, &sid()?, Some(&vid), items).await
            }
            "requestData" => {
                let request: proto::DataRequest = proto::decode(second("request")?)?;
                let vid: VehicleId = request.vid.ok_or(DispatchError::MissingParameter("vid"))?.into();
                self.dispatcher.forward(action, &sid()?, Some(&vid), items).await
            }
            "control" => {
                let command: proto::Control = proto::decode(second("control")?)?;
                match (command.command, command.vid) {
                    (Some(control::Command::Avcommand(_)), Some(vid)) => {
                        let vid = VehicleId::from(vid);
                        self.dispatcher.forward(action, &sid()?, Some(&vid), items).await
                    }
                    (Some(control::Command::Avcommand(_)), None) => Err(DispatchError::MissingParameter("vid")),
                    (Some(control::Command::SimCommand(_)), _) => {
                        self.dispatcher.forward(action, &sid()?, None, items).await
                    }
                    (None, _) => Err(DispatchError::MissingParameter("command")),
                }
            }
            "stop" | "trace" => self.dispatcher.forward(action, &sid()?, None, items).await,
            "status" => self.status(&sid()?, items).await,
            "result" => self.result(&sid()?, items).await,
            "runningTests" => {
                let raw = items.first().ok_or(DispatchError::BadUser)?;
                let user: proto::User = proto::decode(raw).map_err(|_| DispatchError::BadUser)?;
                self.registry.prune_dead().await;
                let running = self.dispatcher.running_tests(&user).await?;
                if running.is_empty() {
                    Ok(proto::SubmissionResult::message(proto::NO_SIMULATIONS_RUNNING).encode_to_vec())
                } else {
                    Ok(proto::SubmissionResult::submitted(running).encode_to_vec())
                }
            }
            "generateSid" => Ok(proto::SimulationId::from(&self.store.next_sid()?).encode_to_vec()),
            other => Err(DispatchError::NotImplemented(other.to_string())),
        }
    }
}

/// Serves one client connection.
struct ClientRequestHandler<Ctx: DriveBuildContext> {
    app: Arc<MainApplication<Ctx>>,
}

#[async_trait]
impl<Ctx: DriveBuildContext> RequestHandler for ClientRequestHandler<Ctx> {
    async fn handle(&self, action: &str, items: Vec<Vec<u8>>) -> Vec<u8> {
        let reply = match self.app.handle_client(action, &items).await {
            Ok(body) => proto::Reply {
                status: Status::Ok.code(),
                body,
            },
            Err(e) => {
                let status = e.status();
                warn!("Client action {} failed with {}: {}", action, status.code(), e);
                if action == "runTests" {
                    proto::Reply::new(status.code(), &proto::SubmissionResult::message(e.to_string()))
                } else {
                    proto::Reply::new(status.code(), &proto::Void::new(e.to_string()))
                }
            }
        };
        reply.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledTestStore;
    use drivebuild_env::TokioContext;

    fn local() -> MainAppConfig {
        MainAppConfig {
            node_addr: "127.0.0.1:0".parse().unwrap(),
            client_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn client_call(addr: SocketAddr, action: &str, items: &[Vec<u8>]) -> proto::Reply {
        let socket = FramedSocket::connect(addr, FramingConfig::default()).await.unwrap();
        multiplexer::call(&socket, action, items).await.unwrap()
    }

    #[tokio::test]
    async fn test_client_port_error_statuses() {
        let store: Arc<dyn TestStore> = Arc::new(SledTestStore::open_temp().unwrap());
        store.add_user("alice", "secret").unwrap();
        let app = Arc::new(MainApplication::new(TokioContext::shared(), store, local()));
        let ports = app.listen().await.unwrap();

        let reply = client_call(ports.client_addr, "fly", &[]).await;
        assert_eq!(reply.status, 501);

        let reply = client_call(ports.client_addr, "runTests", &[b"x".to_vec(), vec![0xff, 0xff]]).await;
        assert_eq!(reply.status, 400);
        let body: proto::SubmissionResult = proto::decode(&reply.body).unwrap();
        match body.outcome {
            Some(proto::submission_result::Outcome::Message(v)) => {
                assert_eq!(v.message, "The user parameter could not be parsed.")
            }
            other => panic!("unexpected {:?}", other),
        }

        let user = proto::User::new("alice", "wrong").encode_to_vec();
        assert_eq!(client_call(ports.client_addr, "runTests", &[b"x".to_vec(), user]).await.status, 401);

        let user = proto::User::new("alice", "secret").encode_to_vec();
        assert_eq!(client_call(ports.client_addr, "runTests", &[b"x".to_vec(), user]).await.status, 503);
    }

    #[tokio::test]
    async fn test_status_of_unknown_simulation_is_unknown() {
        let store: Arc<dyn TestStore> = Arc::new(SledTestStore::open_temp().unwrap());
        let app = Arc::new(MainApplication::new(TokioContext::shared(), store, local()));
        let ports = app.listen().await.unwrap();

        let sid = proto::SimulationId::new("77").encode_to_vec();
        let reply = client_call(ports.client_addr, "status", &[sid.clone()]).await;
        assert_eq!(reply.status, 200);
        let state: proto::SimStateResponse = proto::decode(&reply.body).unwrap();
        assert_eq!(state.state(), proto::SimState::Unknown);

        let reply = client_call(ports.client_addr, "stop", &[sid]).await;
        assert_eq!(reply.status, 400);

        let reply = client_call(ports.client_addr, "generateSid", &[]).await;
        let fresh: proto::SimulationId = proto::decode(&reply.body).unwrap();
        assert!(!fresh.sid.is_empty());
    }
}
