//! Simulation node: hosts simulations and answers the node-local actions.
//!
//! # Architecture
//!
//! ```text
//!              main application (node port)
//!                 │ control socket      │ one side channel per (sid, vid)
//!                 ▼                     ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    NodeRequestHandler                    │
//! │  action ──► SimulationNode::{run_tests, control, ...}    │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────┐
//! │ SimulationNode                                           │
//! │  simulations: sid -> Simulation ── verification task     │
//! │  barrier: RendezvousBarrier                              │
//! │  store / sid allocator / test loader                     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use crate::rendezvous::{Release, RendezvousBarrier};
use crate::simulation::{Simulation, NOT_RUNNING};
use crate::simulator::SimulatorError;
use crate::store::{SidAllocator, StoreError, TestStore};
use crate::testcase::{LoadError, TestLoader};
use crate::verification::{
    run_verification, timestamp, CriteriaEvaluation, Outcome, SimState, Verdict, VerificationConfig,
};
use async_trait::async_trait;
use drivebuild_env::multiplexer::{self, RequestHandler};
use drivebuild_env::proto::{self, control, SimCommandKind};
use drivebuild_env::{
    DriveBuildContext, EnvError, FramedSocket, FramingConfig, NodeId, SimulationId, VehicleId,
};
use prost::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Configuration of a simulation node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Parent of the per-simulation work directories
    pub work_dir: PathBuf,

    pub verification: VerificationConfig,

    pub framing: FramingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("drivebuild"),
            verification: VerificationConfig::default(),
            framing: FramingConfig::default(),
        }
    }
}

/// Errors of node-local actions. Every one of them ends up as a `Void`
/// reply; none crosses the connection.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    #[error("The request misses the parameter \"{0}\".")]
    MissingItem(&'static str),

    #[error("There is no simulation with ID \"{0}\".")]
    UnknownSimulation(SimulationId),

    #[error("Handshake with {0} failed: {1}")]
    Handshake(SocketAddr, String),
}

/// One worker process hosting simulations.
pub struct SimulationNode<Ctx: DriveBuildContext> {
    ctx: Arc<Ctx>,
    config: NodeConfig,
    store: Arc<dyn TestStore>,
    sids: Arc<dyn SidAllocator>,
    loader: Arc<dyn TestLoader>,
    /// Live simulations. Finished ones leave once their record is persisted.
    simulations: Arc<RwLock<HashMap<SimulationId, Arc<Simulation>>>>,
    barrier: Arc<RendezvousBarrier>,
}

impl<Ctx: DriveBuildContext> SimulationNode<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: NodeConfig,
        store: Arc<dyn TestStore>,
        sids: Arc<dyn SidAllocator>,
        loader: Arc<dyn TestLoader>,
    ) -> Self {
        Self {
            ctx,
            config,
            store,
            sids,
            loader,
            simulations: Arc::new(RwLock::new(HashMap::new())),
            barrier: Arc::new(RendezvousBarrier::new()),
        }
    }

    pub fn barrier(&self) -> &Arc<RendezvousBarrier> {
        &self.barrier
    }

    pub async fn simulation(&self, sid: &SimulationId) -> Option<Arc<Simulation>> {
        self.simulations.read().await.get(sid).cloned()
    }

    async fn existing(&self, sid: &SimulationId) -> Result<Arc<Simulation>, NodeError> {
        self.simulation(sid)
            .await
            .ok_or_else(|| NodeError::UnknownSimulation(sid.clone()))
    }

    /// Whether `sid` names a simulation that ran here and is persisted.
    fn recorded(&self, sid: &SimulationId) -> bool {
        matches!(self.store.test(sid), Ok(Some(_)))
    }

    /// Loads every test of a submission and starts its verification loop.
    ///
    /// Returns test name to simulation id.
    pub async fn run_tests(
        &self,
        payload: &[u8],
        user: &proto::User,
    ) -> Result<HashMap<String, proto::SimulationId>, NodeError> {
        let loaded = self.loader.load(payload)?;
        let mut submissions = HashMap::new();

        for test in loaded {
            let sid = self.sids.generate_sid().await?;
            let name = test.case.name.clone();
            let work_dir = self.config.work_dir.join(sid.as_str());
            let username = Some(user.username.clone()).filter(|u| !u.is_empty());
            let sim = Simulation::start(sid.clone(), test, username, work_dir, timestamp(&*self.ctx)).await?;
            let sim = Arc::new(sim);

            self.store.put_test(&sim.record())?;
            self.barrier.open(&sid).await;
            self.simulations.write().await.insert(sid.clone(), sim.clone());

            let (ctx, barrier, store) = (self.ctx.clone(), self.barrier.clone(), self.store.clone());
            let config = self.config.verification.clone();
            let simulations = self.simulations.clone();
            self.ctx.spawn(&format!("verification-{}", sid), async move {
                let sid = sim.sid.clone();
                let outcome = run_verification(ctx, sim.clone(), barrier, store, config).await;
                debug!("Verification task of {} ended with {:?}", sid, outcome);
                sim.wait_settled().await;
                simulations.write().await.remove(&sid);
                debug!("Evicted finished simulation {}", sid);
            });

            info!("Started simulation {} for test \"{}\"", sid, name);
            submissions.insert(name, proto::SimulationId::from(&sid));
        }
        Ok(submissions)
    }

    /// AI side of the rendezvous. Answers the simulation state after the
    /// release.
    pub async fn wait_for_simulator_request(&self, sid: &SimulationId, vid: &VehicleId) -> SimState {
        let release = self.barrier.wait_for_simulator_request(sid, vid).await;
        debug!("AI {}/{} released: {:?}", sid, vid, release);
        self.status(sid).await
    }

    pub async fn request_ai_for(&self, sid: &SimulationId, vid: &VehicleId) -> Release {
        self.barrier.request_ai_for(sid, vid).await
    }

    pub async fn request_data(&self, sid: &SimulationId, request: &proto::DataRequest) -> proto::DataResponse {
        let vid = VehicleId::from(request.vid.clone().unwrap_or_default());
        match self.simulation(sid).await {
            Some(sim) => sim.data_response(&vid, &request.request_ids).await,
            None => {
                let message = if self.recorded(sid) {
                    NOT_RUNNING.to_string()
                } else {
                    NodeError::UnknownSimulation(sid.clone()).to_string()
                };
                proto::DataResponse {
                    data: request
                        .request_ids
                        .iter()
                        .map(|rid| (rid.clone(), proto::Data::error(message.clone())))
                        .collect(),
                }
            }
        }
    }

    /// Applies an AI command or a simulation command.
    pub async fn control(&self, sid: &SimulationId, control: proto::Control) -> Result<String, NodeError> {
        match control.command {
            Some(control::Command::Avcommand(command)) => {
                let sim = self.existing(sid).await?;
                let vid = VehicleId::from(control.vid.ok_or(NodeError::MissingItem("vid"))?);
                if sim.simulator.control(&vid, &command).await? {
                    Ok(format!("Applied command to {}.", vid))
                } else {
                    Ok(format!("Ignored command since {} is not driven by an AI.", vid))
                }
            }
            Some(control::Command::SimCommand(command)) => {
                let verdict = match command.command() {
                    SimCommandKind::Resume => return Ok(format!("Simulation {} resumed.", sid)),
                    SimCommandKind::Succeed => Verdict::Succeeded,
                    SimCommandKind::Fail => Verdict::Failed,
                    SimCommandKind::Cancel => Verdict::Skipped,
                };
                if self.stop(sid, verdict).await? {
                    Ok(format!("Simulation {} stopped with {:?}.", sid, verdict))
                } else {
                    Ok(format!("Simulation {} had already terminated.", sid))
                }
            }
            None => Err(NodeError::MissingItem("command")),
        }
    }

    /// Forces a terminal verdict. Returns false if the simulation had
    /// already terminated.
    pub async fn stop(&self, sid: &SimulationId, verdict: Verdict) -> Result<bool, NodeError> {
        let sim = match self.simulation(sid).await {
            Some(sim) => sim,
            None if self.recorded(sid) => return Ok(false),
            None => return Err(NodeError::UnknownSimulation(sid.clone())),
        };
        let stopped = sim
            .finish(
                Outcome::from_verdict(verdict),
                timestamp(&*self.ctx),
                &self.barrier,
                &*self.store,
            )
            .await;
        if stopped {
            info!("Simulation {} stopped externally with {:?}", sid, verdict);
        }
        Ok(stopped)
    }

    /// Running simulations, optionally only those of one user.
    pub async fn running_tests(&self, username: Option<&str>) -> HashMap<String, proto::SimulationId> {
        let simulations = self.simulations.read().await;
        let mut running = HashMap::new();
        for sim in simulations.values().filter(|s| s.is_running()) {
            if username.is_some() && sim.username.as_deref() != username {
                continue;
            }
            let mut name = sim.case.name.clone();
            if running.contains_key(&name) {
                name = format!("{} ({})", name, sim.sid);
            }
            running.insert(name, proto::SimulationId::from(&sim.sid));
        }
        running
    }

    pub async fn is_running(&self, sid: &SimulationId) -> bool {
        self.simulation(sid).await.map_or(false, |s| s.is_running())
    }

    pub async fn vids(&self, sid: &SimulationId) -> Result<Vec<VehicleId>, NodeError> {
        let sim = self.existing(sid).await?;
        Ok(sim.case.participants.iter().map(|p| p.id.clone()).collect())
    }

    pub async fn poll_sensors(&self, sid: &SimulationId) -> Result<(), NodeError> {
        Ok(self.existing(sid).await?.simulator.poll_sensors().await?)
    }

    pub async fn verify(&self, sid: &SimulationId) -> Result<CriteriaEvaluation, NodeError> {
        Ok(self.existing(sid).await?.evaluate().await)
    }

    pub async fn steps(&self, sid: &SimulationId, ticks: u32) -> Result<(), NodeError> {
        Ok(self.existing(sid).await?.simulator.step(ticks).await?)
    }

    pub async fn store_verification_cycle(&self, sid: &SimulationId) -> Result<(), NodeError> {
        let sim = self.existing(sid).await?;
        let now = timestamp(&*self.ctx);
        sim.store_cycle(&*self.store, now, now).await;
        Ok(())
    }

    /// Status of a hosted simulation, falling back to the persisted record.
    pub async fn status(&self, sid: &SimulationId) -> SimState {
        if let Some(sim) = self.simulation(sid).await {
            return sim.state();
        }
        match self.store.test(sid) {
            Ok(Some(record)) => record.status,
            Ok(None) => SimState::Unknown,
            Err(e) => {
                warn!("Reading record of {} failed: {}", sid, e);
                SimState::Unknown
            }
        }
    }

    pub async fn result(&self, sid: &SimulationId) -> Verdict {
        if let Some(sim) = self.simulation(sid).await {
            return sim.verdict();
        }
        match self.store.test(sid) {
            Ok(Some(record)) => record.result,
            _ => Verdict::Unknown,
        }
    }

    pub async fn trace(&self, sid: &SimulationId, vid: Option<&VehicleId>) -> Result<proto::Trace, NodeError> {
        let entries = self
            .store
            .cycles(sid, vid)?
            .into_iter()
            .map(|cycle| proto::TraceEntry {
                vid: cycle.vid.to_string(),
                tick: cycle.tick,
                data: proto::DataResponse::decode(cycle.data.as_slice()).ok(),
                started_ms: cycle.started.timestamp_millis(),
                finished_ms: cycle.finished.timestamp_millis(),
            })
            .collect();
        Ok(proto::Trace { entries })
    }

    pub async fn generate_sid(&self) -> Result<SimulationId, NodeError> {
        Ok(self.sids.generate_sid().await?)
    }

    /// Registers with the main application and serves its control socket.
    pub async fn join_main_app(self: &Arc<Self>, addr: SocketAddr) -> Result<NodeId, NodeError> {
        let socket = Arc::new(FramedSocket::connect(addr, self.config.framing.clone()).await?);
        let snid = handshake(&socket, &proto::SimulationNodeId::default()).await?;
        info!("Registered at {} as {}", addr, snid);

        let handler = Arc::new(NodeRequestHandler {
            node: self.clone(),
            main_app: addr,
            snid: snid.clone(),
        });
        serve(&*self.ctx, "node-control", socket, handler);
        Ok(snid)
    }
}

/// Sends the hello frame and reads the assigned node id.
async fn handshake(socket: &FramedSocket, hello: &proto::SimulationNodeId) -> Result<NodeId, NodeError> {
    socket.send(&hello.encode_to_vec()).await?;
    let answer: proto::SimulationNodeId = proto::decode(&socket.receive().await?)?;
    if answer.snid.is_empty() {
        return Err(NodeError::Handshake(socket.peer(), "no node id assigned".into()));
    }
    if !hello.snid.is_empty() && hello.snid != answer.snid {
        return Err(NodeError::Handshake(
            socket.peer(),
            format!("expected {}, got {}", hello.snid, answer.snid),
        ));
    }
    Ok(NodeId::new(answer.snid))
}

fn serve<Ctx: DriveBuildContext>(ctx: &Ctx, name: &str, socket: Arc<FramedSocket>, handler: Arc<NodeRequestHandler<Ctx>>) {
    ctx.spawn(name, async move {
        if let Err(e) = multiplexer::process_requests(&socket, &*handler).await {
            error!("Connection {} to the main application failed: {}", socket.peer(), e);
        }
    });
}

fn item<M: Message + Default>(items: &[Vec<u8>], index: usize, name: &'static str) -> Result<M, NodeError> {
    let raw = items.get(index).ok_or(NodeError::MissingItem(name))?;
    Ok(proto::decode(raw)?)
}

fn sid_item(items: &[Vec<u8>]) -> Result<SimulationId, NodeError> {
    Ok(item::<proto::SimulationId>(items, 0, "sid")?.into())
}

fn void(message: impl Into<String>) -> Vec<u8> {
    proto::Void::new(message).encode_to_vec()
}

/// Answers requests arriving from the main application.
pub struct NodeRequestHandler<Ctx: DriveBuildContext> {
    node: Arc<SimulationNode<Ctx>>,
    main_app: SocketAddr,
    snid: NodeId,
}

impl<Ctx: DriveBuildContext> NodeRequestHandler<Ctx> {
    /// Opens an extra connection for one vehicle's blocking calls.
    fn open_side_channel(&self) {
        let node = self.node.clone();
        let (main_app, snid) = (self.main_app, self.snid.clone());
        let handler = Arc::new(NodeRequestHandler {
            node: node.clone(),
            main_app,
            snid: snid.clone(),
        });
        self.node.ctx.spawn("side-channel", async move {
            let socket = match FramedSocket::connect(main_app, node.config.framing.clone()).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!("Opening side channel to {} failed: {}", main_app, e);
                    return;
                }
            };
            if let Err(e) = handshake(&socket, &proto::SimulationNodeId::from(&snid)).await {
                warn!("Side channel handshake failed: {}", e);
                return;
            }
            debug!("Side channel {} of {} open", socket.peer(), snid);
            if let Err(e) = multiplexer::process_requests(&socket, &*handler).await {
                error!("Side channel {} failed: {}", socket.peer(), e);
            }
        });
    }

    async fn dispatch(&self, action: &str, items: &[Vec<u8>]) -> Result<Vec<u8>, NodeError> {
        let node = &self.node;
        let reply = match action {
            "runTests" => {
                let payload = items.first().ok_or(NodeError::MissingItem("tests"))?;
                let user: proto::User = item(items, 1, "user")?;
                match node.run_tests(payload, &user).await {
                    Ok(submissions) => proto::SubmissionResult::submitted(submissions).encode_to_vec(),
                    Err(e) => {
                        warn!("Rejected submission of {}: {}", user.username, e);
                        proto::SubmissionResult::message(e.to_string()).encode_to_vec()
                    }
                }
            }
            "waitForSimulatorRequest" => {
                let vid: proto::VehicleId = item(items, 1, "vid")?;
                let state = node.wait_for_simulator_request(&sid_item(items)?, &vid.into()).await;
                proto::SimStateResponse::with_state(state.into()).encode_to_vec()
            }
            "requestAiFor" => {
                let sid = sid_item(items)?;
                let vid: VehicleId = item::<proto::VehicleId>(items, 1, "vid")?.into();
                match node.request_ai_for(&sid, &vid).await {
                    Release::Paired => void(format!("{} took its turn.", vid)),
                    Release::SimulationEnded => void(format!("Simulation {} ended.", sid)),
                }
            }
            "requestData" => {
                let request: proto::DataRequest = item(items, 1, "request")?;
                node.request_data(&sid_item(items)?, &request).await.encode_to_vec()
            }
            "control" => {
                let control: proto::Control = item(items, 1, "control")?;
                void(node.control(&sid_item(items)?, control).await?)
            }
            "stop" => {
                let sid = sid_item(items)?;
                let result: proto::TestResult = item(items, 1, "result")?;
                let verdict = Verdict::from(result.result());
                if node.stop(&sid, verdict).await? {
                    void(format!("Stopped simulation {}.", sid))
                } else {
                    void(format!("Simulation {} had already terminated.", sid))
                }
            }
            "runningTests" => {
                let user: proto::User = item(items, 0, "user")?;
                let username = Some(user.username.as_str()).filter(|u| !u.is_empty());
                let running = node.running_tests(username).await;
                if running.is_empty() {
                    proto::SubmissionResult::message(proto::NO_SIMULATIONS_RUNNING).encode_to_vec()
                } else {
                    proto::SubmissionResult::submitted(running).encode_to_vec()
                }
            }
            "isRunning" => proto::Bool::new(node.is_running(&sid_item(items)?).await).encode_to_vec(),
            "vids" => proto::VehicleIds {
                vids: node
                    .vids(&sid_item(items)?)
                    .await?
                    .into_iter()
                    .map(|v| v.to_string())
                    .collect(),
            }
            .encode_to_vec(),
            "pollSensors" => {
                let sid = sid_item(items)?;
                node.poll_sensors(&sid).await?;
                void(format!("Polled sensors of {}.", sid))
            }
            "verify" => node.verify(&sid_item(items)?).await?.to_proto().encode_to_vec(),
            "steps" => {
                let sid = sid_item(items)?;
                let ticks: proto::Num = item(items, 1, "steps")?;
                let ticks = u32::try_from(ticks.num)
                    .map_err(|_| EnvError::protocol(format!("invalid step count {}", ticks.num)))?;
                node.steps(&sid, ticks).await?;
                void(format!("Simulated {} steps of {}.", ticks, sid))
            }
            "storeVerificationCycle" => {
                let sid = sid_item(items)?;
                node.store_verification_cycle(&sid).await?;
                void(format!("Stored verification cycle of {}.", sid))
            }
            "generateSid" => proto::SimulationId::from(&node.generate_sid().await?).encode_to_vec(),
            "status" => {
                let state = node.status(&sid_item(items)?).await;
                proto::SimStateResponse::with_state(state.into()).encode_to_vec()
            }
            "result" => {
                let verdict = node.result(&sid_item(items)?).await;
                proto::TestResult::with_verdict(verdict.into()).encode_to_vec()
            }
            "trace" => {
                let vid = items
                    .get(1)
                    .map(|raw| proto::decode::<proto::VehicleId>(raw))
                    .transpose()?
                    .map(VehicleId::from);
                node.trace(&sid_item(items)?, vid.as_ref()).await?.encode_to_vec()
            }
            "requestSocket" => {
                self.open_side_channel();
                void("Opening socket.")
            }
            unknown => void(format!("The action \"{}\" is unknown.", unknown)),
        };
        Ok(reply)
    }
}

#[async_trait]
impl<Ctx: DriveBuildContext> RequestHandler for NodeRequestHandler<Ctx> {
    async fn handle(&self, action: &str, items: Vec<Vec<u8>>) -> Vec<u8> {
        match self.dispatch(action, &items).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Action {} on {} failed: {}", action, self.snid, e);
                void(e.to_string())
            }
        }
    }
}
