//! DriveBuild example agent
//!
//! Drives one vehicle of a running simulation through the main
//! application's client port:
//! - waits for the simulation to hand over a turn
//! - reads the vehicle's declared data requests
//! - answers with a throttle / steer / brake command
//!
//! With `--bundle` the agent submits the tests itself and drives the
//! vehicle in the test named by `--test`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use drivebuild_core::AiExchangeClient;
use drivebuild_env::{proto, FramingConfig, SimulationId, VehicleId};
use drivebuild_sim::{drive, CruiseDriver};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "drivebuild-agent")]
#[command(about = "Drive one vehicle of a DriveBuild simulation", long_about = None)]
struct Args {
    /// Client address of the main application
    #[arg(long, default_value = "127.0.0.1:5003")]
    client: String,

    /// Simulation to join
    #[arg(long, conflicts_with = "bundle")]
    sid: Option<String>,

    /// Test bundle to submit before driving
    #[arg(long, requires_all = ["username", "password", "test"])]
    bundle: Option<PathBuf>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Name of the submitted test whose vehicle to drive
    #[arg(long)]
    test: Option<String>,

    /// Vehicle to drive
    #[arg(long, default_value = "ego")]
    vid: String,

    /// Speed to hold in m/s
    #[arg(long, default_value = "10.0")]
    target_speed: f64,

    /// Rid of the vehicle's speed request
    #[arg(long, default_value = "speed")]
    speed_request: String,

    /// Rid of the vehicle's car-to-lane-angle request
    #[arg(long)]
    angle_request: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

async fn connect(addr: &str) -> Result<AiExchangeClient> {
    let addr = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Cannot resolve {}", addr))?
        .next()
        .with_context(|| format!("{} resolves to no address", addr))?;
    Ok(AiExchangeClient::connect(addr, FramingConfig::default()).await?)
}

async fn submit(args: &Args, path: &PathBuf) -> Result<SimulationId> {
    let payload = std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let user = proto::User::new(
        args.username.clone().unwrap_or_default(),
        args.password.clone().unwrap_or_default(),
    );
    let client = connect(&args.client).await?;
    let mut submitted = client.run_tests(&payload, &user).await?;
    let test = args.test.as_deref().unwrap_or_default();
    match submitted.remove(test) {
        Some(sid) => Ok(sid),
        None => bail!("The submission contains no test named {:?}", test),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let sid = match (&args.sid, &args.bundle) {
        (Some(sid), _) => SimulationId::new(sid.clone()),
        (None, Some(path)) => submit(&args, path).await?,
        (None, None) => bail!("Either --sid or --bundle is required"),
    };
    let vid = VehicleId::new(args.vid.clone());

    let mut driver = CruiseDriver::new(args.target_speed, &args.speed_request);
    if let Some(angle) = &args.angle_request {
        driver = driver.keeping_lane(angle);
    }

    info!("Driving {}/{} at {} m/s", sid, vid, args.target_speed);
    let client = connect(&args.client).await?;
    let summary = drive(&client, &sid, &vid, &driver).await?;
    let verdict = client.result(&sid).await?;
    info!(
        "{}/{} released after {} turns: {:?}, result {:?}",
        sid, vid, summary.turns, summary.final_state, verdict
    );
    Ok(())
}
