//! LocalCluster - one main application and N simulation nodes in-process.
//!
//! All services talk over real localhost TCP, exactly as separate processes
//! would; only the clock is shared.

use crate::bundle::BundleLoader;
use crate::context::SimContext;
use drivebuild_core::registry::NodeLoad;
use drivebuild_core::{
    AiExchangeClient, ClientError, DispatchConfig, MainAppConfig, MainApplication, NodeConfig, NodeError,
    RemoteSidAllocator, SimulationNode, SledTestStore, StoreError, TestStore, VerificationConfig,
};
use drivebuild_env::{EnvError, FramingConfig, NodeId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

static CLUSTER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for a local cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed of the virtual clock and the first loaded scenario
    pub seed: u64,

    /// Number of simulation nodes to start
    pub nodes: usize,

    pub verification: VerificationConfig,

    pub dispatch: DispatchConfig,

    pub framing: FramingConfig,

    /// Parent of the cluster's work directories
    pub work_dir: PathBuf,

    /// Sled database path; a temporary store when absent
    pub db: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            nodes: 2,
            verification: VerificationConfig {
                timeout: Some(Duration::from_secs(120)),
                pace: Some(Duration::from_millis(100)),
            },
            dispatch: DispatchConfig::default(),
            framing: FramingConfig::default(),
            work_dir: std::env::temp_dir().join("drivebuild-cluster"),
            db: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A running cluster.
pub struct LocalCluster {
    /// Shared virtual clock
    pub context: Arc<SimContext>,

    pub store: Arc<dyn TestStore>,

    pub app: Arc<MainApplication<SimContext>>,

    /// Nodes in join order with the ids the main application assigned
    pub nodes: Vec<(NodeId, Arc<SimulationNode<SimContext>>)>,

    client_addr: SocketAddr,

    framing: FramingConfig,

    work_dir: PathBuf,
}

impl LocalCluster {
    /// Starts the main application on ephemeral ports and joins the nodes.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        let context = SimContext::shared(config.seed);
        let store: Arc<dyn TestStore> = match &config.db {
            Some(path) => Arc::new(SledTestStore::open(path)?),
            None => Arc::new(SledTestStore::open_temp()?),
        };

        let app_config = MainAppConfig {
            node_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            client_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            framing: config.framing.clone(),
            dispatch: config.dispatch.clone(),
            ..Default::default()
        };
        let app = Arc::new(MainApplication::new(context.clone(), store.clone(), app_config));
        let ports = app.listen().await?;

        let work_dir = config.work_dir.join(format!(
            "{}-{}-{}",
            std::process::id(),
            config.seed,
            CLUSTER_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let loader = Arc::new(BundleLoader::new(config.seed));
        let mut nodes = Vec::with_capacity(config.nodes);
        for index in 0..config.nodes {
            let sids = Arc::new(RemoteSidAllocator::connect(ports.client_addr, config.framing.clone()).await?);
            let node_config = NodeConfig {
                work_dir: work_dir.join(format!("node{}", index)),
                verification: config.verification.clone(),
                framing: config.framing.clone(),
            };
            let node = Arc::new(SimulationNode::new(
                context.clone(),
                node_config,
                store.clone(),
                sids,
                loader.clone(),
            ));
            let id = node.join_main_app(ports.node_addr).await?;
            nodes.push((id, node));
        }
        info!(
            "Local cluster with {} nodes up, clients on {}",
            nodes.len(),
            ports.client_addr
        );

        Ok(Self {
            context,
            store,
            app,
            nodes,
            client_addr: ports.client_addr,
            framing: config.framing,
            work_dir,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Opens a fresh client connection; use one per AI vehicle.
    pub async fn client(&self) -> Result<AiExchangeClient, ClientError> {
        AiExchangeClient::connect(self.client_addr, self.framing.clone()).await
    }

    pub fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        self.store.add_user(username, password)
    }

    /// Simulations assigned per node, as the dispatcher sees them.
    pub async fn loads(&self) -> Vec<NodeLoad> {
        self.app.registry().loads().await
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nodes_register_with_distinct_ids() {
        let cluster = LocalCluster::start(ClusterConfig {
            nodes: 3,
            ..Default::default()
        })
        .await
        .unwrap();

        let ids: Vec<String> = cluster.nodes.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["snid_0", "snid_1", "snid_2"]);
        assert_eq!(cluster.app.registry().len().await, 3);
        assert!(cluster.loads().await.iter().all(|load| load.simulations == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nodes_allocate_ids_through_main_app() {
        let cluster = LocalCluster::start(ClusterConfig::default()).await.unwrap();
        let a = cluster.nodes[0].1.generate_sid().await.unwrap();
        let b = cluster.nodes[1].1.generate_sid().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_persistent_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::start(ClusterConfig {
            nodes: 1,
            work_dir: dir.path().join("work"),
            db: Some(dir.path().join("db")),
            ..Default::default()
        })
        .await
        .unwrap();

        cluster.add_user("carol", "pw").unwrap();
        assert!(cluster.store.login_correct("carol", "pw").unwrap());
        assert!(dir.path().join("db").exists());
        assert!(cluster.work_dir.starts_with(dir.path()));

        let first = cluster.nodes[0].1.generate_sid().await.unwrap();
        let second = cluster.nodes[0].1.generate_sid().await.unwrap();
        assert_ne!(first, second);
    }
}
