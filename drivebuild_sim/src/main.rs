//! DriveBuild CLI
//!
//! Runs the main application, a simulation node, or the built-in scenarios
//! against an in-process cluster.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use drivebuild_core::{
    AiExchangeClient, DispatchConfig, MainAppConfig, MainApplication, NodeConfig, RemoteSidAllocator,
    SimulationNode, SledTestStore, TestStore, VerificationConfig,
};
use drivebuild_env::{proto, FramingConfig, TokioContext};
use drivebuild_sim::scenarios::ScenarioId;
use drivebuild_sim::{BundleLoader, ScenarioResult, ScenarioRunner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// DriveBuild test orchestration
#[derive(Parser, Debug)]
#[command(name = "drivebuild")]
#[command(about = "Distributed test orchestration for driving simulations", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the node-registration and client ports
    MainApp(MainAppArgs),

    /// Join a main application and host simulations
    SimNode(SimNodeArgs),

    /// Submit a JSON test bundle file
    Submit(SubmitArgs),

    /// Run built-in scenarios against an in-process cluster
    Scenario(ScenarioArgs),
}

#[derive(Args, Debug)]
struct MainAppArgs {
    /// Port simulation nodes register at
    #[arg(long, default_value = "5004")]
    node_port: u16,

    /// Port AI clients talk to
    #[arg(long, default_value = "5003")]
    client_port: u16,

    /// Sled database directory
    #[arg(long, default_value = "drivebuild-main.db")]
    db: PathBuf,

    /// Simulations one user may run at the same time
    #[arg(long, default_value = "2")]
    quota: usize,

    /// Users to create, as name:password
    #[arg(long = "user")]
    users: Vec<String>,
}

#[derive(Args, Debug)]
struct SimNodeArgs {
    /// Node-registration address of the main application
    #[arg(long, default_value = "127.0.0.1:5004")]
    main_app: String,

    /// Client address of the main application, used for simulation ids
    #[arg(long, default_value = "127.0.0.1:5003")]
    client: String,

    /// Sled database directory for records and traces
    #[arg(long, default_value = "drivebuild-node.db")]
    db: PathBuf,

    /// Parent of the per-simulation work directories
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Wall-clock budget of one simulation in seconds (0 = unlimited)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Seed of the first loaded scenario
    #[arg(short, long, default_value = "42")]
    seed: u64,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Client address of the main application
    #[arg(long, default_value = "127.0.0.1:5003")]
    client: String,

    #[arg(long)]
    username: String,

    #[arg(long)]
    password: String,

    /// JSON file with one bundle or an array of bundles
    bundle: PathBuf,
}

#[derive(Args, Debug)]
struct ScenarioArgs {
    /// Master seed for determinism
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of seeds to run, counting up from --seed
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Number of simulation nodes
    #[arg(short, long, default_value = "2")]
    nodes: usize,

    /// Scenario to run (speed_limit, off_road_start, collision, lane_keeping, endless, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Verification budget in simulated seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    match cli.command {
        Command::MainApp(args) => run_main_app(args).await,
        Command::SimNode(args) => run_sim_node(args).await,
        Command::Submit(args) => submit(args).await,
        Command::Scenario(args) => run_scenarios(args).await,
    }
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Cannot resolve {}", addr))?
        .next()
        .with_context(|| format!("{} resolves to no address", addr))
}

async fn run_main_app(args: MainAppArgs) -> anyhow::Result<()> {
    let store: Arc<dyn TestStore> = Arc::new(SledTestStore::open(&args.db)?);
    for user in &args.users {
        let Some((name, password)) = user.split_once(':') else {
            bail!("--user expects name:password, got {}", user);
        };
        store.add_user(name, password)?;
    }

    let config = MainAppConfig {
        node_addr: SocketAddr::from(([0, 0, 0, 0], args.node_port)),
        client_addr: SocketAddr::from(([0, 0, 0, 0], args.client_port)),
        dispatch: DispatchConfig {
            quota: args.quota,
            ..Default::default()
        },
        ..Default::default()
    };
    let app = Arc::new(MainApplication::new(TokioContext::shared(), store, config));
    app.listen().await?;

    tokio::signal::ctrl_c().await?;
    info!("Main application shutting down");
    Ok(())
}

async fn run_sim_node(args: SimNodeArgs) -> anyhow::Result<()> {
    let main_app = resolve(&args.main_app).await?;
    let client = resolve(&args.client).await?;
    let framing = FramingConfig::default();

    let store: Arc<dyn TestStore> = Arc::new(SledTestStore::open(&args.db)?);
    let sids = Arc::new(RemoteSidAllocator::connect(client, framing.clone()).await?);
    let mut config = NodeConfig {
        verification: VerificationConfig {
            timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
            ..Default::default()
        },
        framing,
        ..Default::default()
    };
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }

    let node = Arc::new(SimulationNode::new(
        TokioContext::shared(),
        config,
        store,
        sids,
        Arc::new(BundleLoader::new(args.seed)),
    ));
    let id = node.join_main_app(main_app).await?;
    info!("Simulation node {} joined {}", id, main_app);

    tokio::signal::ctrl_c().await?;
    info!("Simulation node {} shutting down", id);
    Ok(())
}

async fn submit(args: SubmitArgs) -> anyhow::Result<()> {
    let payload = std::fs::read(&args.bundle).with_context(|| format!("Cannot read {}", args.bundle.display()))?;
    let client = AiExchangeClient::connect(resolve(&args.client).await?, FramingConfig::default()).await?;
    let submitted = client
        .run_tests(&payload, &proto::User::new(args.username, args.password))
        .await?;
    let mut names: Vec<_> = submitted.into_iter().collect();
    names.sort();
    for (name, sid) in names {
        println!("{}\t{}", sid, name);
    }
    Ok(())
}

async fn run_scenarios(args: ScenarioArgs) -> anyhow::Result<()> {
    if !args.json {
        info!("DriveBuild scenario runner v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => bail!(
                "{} (available: {}, all)",
                e,
                ScenarioId::all().iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
            ),
        }
    };

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = args.seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.nodes).with_timeout(Duration::from_secs(args.timeout_secs));

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED in {} ms", scenario.name(), seed, result.elapsed_ms);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}
