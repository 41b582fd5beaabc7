//! Registry of simulation nodes kept by the main application.
//!
//! All bookkeeping lives behind one lock: nodes, the simulations assigned
//! to them, their per-vehicle side channels and the side channels they
//! were asked to open but have not opened yet.

use drivebuild_env::proto::{self, SimulationNodeId};
use drivebuild_env::{EnvError, FramedSocket, NodeId, SimulationId, VehicleId};
use prost::Message;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

type VehicleSockets = HashMap<VehicleId, Arc<FramedSocket>>;

struct NodeEntry {
    control: Arc<FramedSocket>,
    simulations: HashMap<SimulationId, VehicleSockets>,
    /// Callers waiting for this node to open a side channel, oldest first
    pending: VecDeque<oneshot::Sender<Arc<FramedSocket>>>,
}

/// What an inbound connection on the node port turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new node; the id was sent back as the hello answer
    Node(NodeId),
    /// A side channel of a known node, handed to a waiting caller
    VehicleChannel(NodeId),
    /// A side channel nobody asked for, or from an unexpected peer
    Superfluous,
}

/// Load of one node as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLoad {
    pub node: NodeId,
    pub simulations: usize,
}

#[derive(Default)]
pub struct SimulationRegistry {
    nodes: Mutex<BTreeMap<NodeId, NodeEntry>>,
}

impl SimulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies an inbound node-port connection by its hello frame and
    /// answers the hello.
    ///
    /// The answer is written while the registry is locked so no dispatch
    /// can use a new control socket before the node has read its id.
    pub async fn register(
        &self,
        socket: Arc<FramedSocket>,
        hello: &SimulationNodeId,
    ) -> Result<Registration, EnvError> {
        let mut nodes = self.nodes.lock().await;

        if hello.snid.is_empty() {
            let id = (0u64..)
                .map(NodeId::from_suffix)
                .find(|id| !nodes.contains_key(id))
                .ok_or_else(|| EnvError::protocol("node ids exhausted"))?;
            socket.send(&SimulationNodeId::from(&id).encode_to_vec()).await?;
            nodes.insert(
                id.clone(),
                NodeEntry {
                    control: socket.clone(),
                    simulations: HashMap::new(),
                    pending: VecDeque::new(),
                },
            );
            info!("Registered simulation node {} at {}", id, socket.peer());
            return Ok(Registration::Node(id));
        }

        let id = NodeId::new(hello.snid.as_str());
        let Some(entry) = nodes.get_mut(&id) else {
            warn!("Side channel from {} claims unknown node {}", socket.peer(), id);
            return Ok(Registration::Superfluous);
        };
        if entry.control.peer().ip() != socket.peer().ip() {
            warn!(
                "Side channel for {} from {} does not match control peer {}",
                id,
                socket.peer(),
                entry.control.peer()
            );
            return Ok(Registration::Superfluous);
        }

        socket.send(&SimulationNodeId::from(&id).encode_to_vec()).await?;
        let mut socket = socket;
        while let Some(waiter) = entry.pending.pop_front() {
            match waiter.send(socket) {
                Ok(()) => {
                    debug!("Side channel of {} handed to waiting caller", id);
                    return Ok(Registration::VehicleChannel(id));
                }
                // The caller gave up waiting
                Err(returned) => socket = returned,
            }
        }
        warn!("Superfluous side channel {} of {}", socket.peer(), id);
        socket.shutdown().await;
        Ok(Registration::Superfluous)
    }

    /// Queues a caller for the next side channel `node` opens.
    pub async fn expect_vehicle_socket(&self, node: &NodeId) -> Option<oneshot::Receiver<Arc<FramedSocket>>> {
        let mut nodes = self.nodes.lock().await;
        let entry = nodes.get_mut(node)?;
        let (tx, rx) = oneshot::channel();
        entry.pending.push_back(tx);
        Some(rx)
    }

    pub async fn attach_vehicle_socket(
        &self,
        node: &NodeId,
        sid: &SimulationId,
        vid: &VehicleId,
        socket: Arc<FramedSocket>,
    ) {
        let mut nodes = self.nodes.lock().await;
        if let Some(entry) = nodes.get_mut(node) {
            entry
                .simulations
                .entry(sid.clone())
                .or_default()
                .insert(vid.clone(), socket);
        }
    }

    pub async fn vehicle_socket(&self, sid: &SimulationId, vid: &VehicleId) -> Option<Arc<FramedSocket>> {
        let nodes = self.nodes.lock().await;
        nodes
            .values()
            .find_map(|entry| entry.simulations.get(sid))
            .and_then(|vehicles| vehicles.get(vid).cloned())
    }

    /// Assigns freshly started simulations to a node.
    pub async fn record_simulations<'a, I>(&self, node: &NodeId, sids: I)
    where
        I: IntoIterator<Item = &'a SimulationId>,
    {
        let mut nodes = self.nodes.lock().await;
        if let Some(entry) = nodes.get_mut(node) {
            for sid in sids {
                entry.simulations.entry(sid.clone()).or_default();
            }
        }
    }

    pub async fn find_node_for(&self, sid: &SimulationId) -> Option<NodeId> {
        let nodes = self.nodes.lock().await;
        nodes
            .iter()
            .find(|(_, entry)| entry.simulations.contains_key(sid))
            .map(|(id, _)| id.clone())
    }

    pub async fn control_socket(&self, node: &NodeId) -> Option<Arc<FramedSocket>> {
        self.nodes.lock().await.get(node).map(|e| e.control.clone())
    }

    /// Control sockets of all nodes in registry order.
    pub async fn control_sockets(&self) -> Vec<(NodeId, Arc<FramedSocket>)> {
        let nodes = self.nodes.lock().await;
        nodes.iter().map(|(id, e)| (id.clone(), e.control.clone())).collect()
    }

    pub async fn loads(&self) -> Vec<NodeLoad> {
        let nodes = self.nodes.lock().await;
        nodes
            .iter()
            .map(|(id, e)| NodeLoad {
                node: id.clone(),
                simulations: e.simulations.len(),
            })
            .collect()
    }

    /// Node with the fewest assigned simulations; the first in registry
    /// order wins ties.
    pub async fn least_loaded(&self) -> Option<NodeId> {
        self.loads()
            .await
            .into_iter()
            .min_by_key(|load| load.simulations)
            .map(|load| load.node)
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }

    /// Drops dead vehicle sockets, then nodes whose control socket is dead.
    pub async fn prune_dead(&self) {
        let snapshot: Vec<(NodeId, Arc<FramedSocket>, Vec<(SimulationId, VehicleId, Arc<FramedSocket>)>)> = {
            let nodes = self.nodes.lock().await;
            nodes
                .iter()
                .map(|(id, e)| {
                    let vehicles = e
                        .simulations
                        .iter()
                        .flat_map(|(sid, vs)| vs.iter().map(move |(vid, s)| (sid.clone(), vid.clone(), s.clone())))
                        .collect();
                    (id.clone(), e.control.clone(), vehicles)
                })
                .collect()
        };

        let mut dead_vehicles = Vec::new();
        let mut dead_nodes = Vec::new();
        for (node, control, vehicles) in snapshot {
            for (sid, vid, socket) in vehicles {
                if !socket.probe().await {
                    dead_vehicles.push((node.clone(), sid, vid));
                }
            }
            if !control.probe().await {
                dead_nodes.push(node);
            }
        }
        if dead_vehicles.is_empty() && dead_nodes.is_empty() {
            return;
        }

        let mut nodes = self.nodes.lock().await;
        for (node, sid, vid) in dead_vehicles {
            if let Some(vehicles) = nodes.get_mut(&node).and_then(|e| e.simulations.get_mut(&sid)) {
                debug!("Dropping dead side channel {}/{} of {}", sid, vid, node);
                vehicles.remove(&vid);
            }
        }
        for node in dead_nodes {
            if nodes.remove(&node).is_some() {
                warn!("Simulation node {} is gone", node);
            }
        }
    }
}

/// Reads the hello frame of an inbound node-port connection.
pub async fn read_hello(socket: &FramedSocket) -> Result<SimulationNodeId, EnvError> {
    proto::decode(&socket.receive().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivebuild_env::FramingConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Connected pair: (main application side, node side).
    async fn pair() -> (Arc<FramedSocket>, Arc<FramedSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { FramedSocket::connect(addr, FramingConfig::default()).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        let server = FramedSocket::new(stream, FramingConfig::default()).unwrap();
        (Arc::new(server), Arc::new(client.await.unwrap()))
    }

    async fn answer(node_side: &FramedSocket) -> String {
        read_hello(node_side).await.unwrap().snid
    }

    #[tokio::test]
    async fn test_node_ids_use_smallest_free_suffix() {
        let registry = SimulationRegistry::new();
        let (a, a_node) = pair().await;
        let (b, b_node) = pair().await;

        let hello = SimulationNodeId::default();
        assert_eq!(registry.register(a, &hello).await.unwrap(), Registration::Node(NodeId::new("snid_0")));
        assert_eq!(registry.register(b, &hello).await.unwrap(), Registration::Node(NodeId::new("snid_1")));
        assert_eq!(answer(&a_node).await, "snid_0");
        assert_eq!(answer(&b_node).await, "snid_1");

        // snid_0 dies and its suffix becomes free again
        a_node.shutdown().await;
        drop(a_node);
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.prune_dead().await;
        assert_eq!(registry.len().await, 1);

        let (c, _c_node) = pair().await;
        assert_eq!(registry.register(c, &hello).await.unwrap(), Registration::Node(NodeId::new("snid_0")));
    }

    #[tokio::test]
    async fn test_side_channel_fulfils_waiter() {
        let registry = SimulationRegistry::new();
        let (control, _control_node) = pair().await;
        let Registration::Node(id) = registry.register(control, &SimulationNodeId::default()).await.unwrap() else {
            panic!("expected a node");
        };

        let (side, _side_node) = pair().await;
        let hello = SimulationNodeId::from(&id);
        // Nobody waits yet
        assert_eq!(registry.register(side, &hello).await.unwrap(), Registration::Superfluous);

        let rx = registry.expect_vehicle_socket(&id).await.unwrap();
        let (side, side_node) = pair().await;
        assert_eq!(
            registry.register(side.clone(), &hello).await.unwrap(),
            Registration::VehicleChannel(id.clone())
        );
        assert_eq!(answer(&side_node).await, id.as_str());
        let socket = rx.await.unwrap();
        assert_eq!(socket.peer(), side.peer());

        let (sid, vid) = (SimulationId::new("1"), VehicleId::new("ego"));
        registry.attach_vehicle_socket(&id, &sid, &vid, socket).await;
        assert!(registry.vehicle_socket(&sid, &vid).await.is_some());
        assert_eq!(registry.find_node_for(&sid).await, Some(id));
    }

    #[tokio::test]
    async fn test_dead_side_channel_pruned_before_node() {
        let registry = SimulationRegistry::new();
        let (control, control_node) = pair().await;
        let Registration::Node(id) = registry.register(control, &SimulationNodeId::default()).await.unwrap() else {
            panic!("expected a node");
        };
        assert_eq!(answer(&control_node).await, id.as_str());

        let (sid, vid) = (SimulationId::new("1"), VehicleId::new("ego"));
        registry.record_simulations(&id, &[sid.clone()]).await;
        let (side, side_node) = pair().await;
        registry.attach_vehicle_socket(&id, &sid, &vid, side).await;
        assert!(registry.vehicle_socket(&sid, &vid).await.is_some());

        // Only the side channel's peer goes away
        side_node.shutdown().await;
        drop(side_node);
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.prune_dead().await;

        assert!(registry.vehicle_socket(&sid, &vid).await.is_none());
        assert_eq!(registry.find_node_for(&sid).await, Some(id.clone()));
        assert!(registry.control_socket(&id).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let registry = SimulationRegistry::new();
        let (control, _control_node) = pair().await;
        let Registration::Node(id) = registry.register(control, &SimulationNodeId::default()).await.unwrap() else {
            panic!("expected a node");
        };
        drop(registry.expect_vehicle_socket(&id).await.unwrap());
        let rx = registry.expect_vehicle_socket(&id).await.unwrap();

        let (side, _side_node) = pair().await;
        let hello = SimulationNodeId::from(&id);
        assert_eq!(registry.register(side, &hello).await.unwrap(), Registration::VehicleChannel(id));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_least_loaded_breaks_ties_in_order() {
        let registry = SimulationRegistry::new();
        let mut ids = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..3 {
            let (control, node_side) = pair().await;
            keep.push(node_side);
            match registry.register(control, &SimulationNodeId::default()).await.unwrap() {
                Registration::Node(id) => ids.push(id),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(registry.least_loaded().await, Some(ids[0].clone()));

        registry.record_simulations(&ids[0], &[SimulationId::new("1")]).await;
        assert_eq!(registry.least_loaded().await, Some(ids[1].clone()));

        registry
            .record_simulations(&ids[1], &[SimulationId::new("2"), SimulationId::new("3")])
            .await;
        assert_eq!(registry.least_loaded().await, Some(ids[2].clone()));
        assert_eq!(registry.find_node_for(&SimulationId::new("3")).await, Some(ids[1].clone()));
        assert_eq!(registry.find_node_for(&SimulationId::new("9")).await, None);
    }
}
