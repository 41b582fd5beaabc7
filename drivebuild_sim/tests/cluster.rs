//! End-to-end tests against a localhost cluster.

use drivebuild_core::{DispatchConfig, Evaluable, Road, SimState, Verdict, VerificationConfig};
use drivebuild_env::proto::{self, SimCommandKind};
use drivebuild_env::{SimulationId, VehicleId};
use drivebuild_sim::scenarios::ScenarioId;
use drivebuild_sim::{drive, ClusterConfig, CruiseDriver, LocalCluster, TestBundle};
use std::time::Duration;

fn user() -> proto::User {
    proto::User::new("alice", "secret")
}

fn payload(scenario: ScenarioId, name: &str) -> Vec<u8> {
    let mut bundle = scenario.bundle();
    bundle.test.name = name.to_string();
    TestBundle::to_payload(&[bundle]).unwrap()
}

/// A cluster whose simulations never end on their own.
async fn patient_cluster(nodes: usize, quota: usize) -> LocalCluster {
    let cluster = LocalCluster::start(ClusterConfig {
        nodes,
        verification: VerificationConfig {
            timeout: None,
            pace: Some(Duration::from_millis(100)),
        },
        dispatch: DispatchConfig {
            quota,
            ..Default::default()
        },
        ..Default::default()
    })
    .await
    .unwrap();
    cluster.add_user("alice", "secret").unwrap();
    cluster.add_user("bob", "secret").unwrap();
    cluster
}

async fn wait_until_done(client: &drivebuild_core::AiExchangeClient, sid: &SimulationId) -> SimState {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let state = client.status(sid).await.unwrap();
            if state != SimState::Running {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_speed_profile_succeeds_end_to_end() {
    let cluster = patient_cluster(2, 2).await;
    let client = cluster.client().await.unwrap();

    let submitted = client
        .run_tests(&payload(ScenarioId::SpeedLimit, "speeding"), &user())
        .await
        .unwrap();
    let sid = submitted["speeding"].clone();

    assert_eq!(wait_until_done(&client, &sid).await, SimState::Finished);
    assert_eq!(client.result(&sid).await.unwrap(), Verdict::Succeeded);

    let trace = client.trace(&sid, Some(&VehicleId::new("ego"))).await.unwrap();
    let ticks: Vec<u64> = trace.entries.iter().map(|e| e.tick).collect();
    assert_eq!(ticks, vec![0, 6]);

    // The record is persisted right after the verdict becomes visible
    let record = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match cluster.store.test(&sid).unwrap() {
                Some(record) if record.finished.is_some() => return record,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(record.test_name, "speeding");
    assert_eq!(record.result, Verdict::Succeeded);
    assert_eq!(record.username.as_deref(), Some("alice"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quota_rejects_third_simulation() {
    let cluster = patient_cluster(2, 2).await;
    let client = cluster.client().await.unwrap();

    let first = client.run_tests(&payload(ScenarioId::Endless, "first"), &user()).await.unwrap();
    let second = client.run_tests(&payload(ScenarioId::Endless, "second"), &user()).await.unwrap();

    let error = client
        .run_tests(&payload(ScenarioId::Endless, "third"), &user())
        .await
        .unwrap_err();
    assert_eq!(error.status(), Some(429));
    let message = error.to_string();
    assert!(message.contains("more than 2 instances"), "{}", message);
    assert!(message.contains("first") && message.contains("second"), "{}", message);

    // Another user is not affected
    let bob = proto::User::new("bob", "secret");
    assert!(client.run_tests(&payload(ScenarioId::Endless, "bobs"), &bob).await.is_ok());

    // Stopping one frees a slot
    let sid = first["first"].clone();
    client.control_sim(&sid, SimCommandKind::Cancel).await.unwrap();
    assert_eq!(wait_until_done(&client, &sid).await, SimState::Canceled);
    assert_eq!(client.result(&sid).await.unwrap(), Verdict::Skipped);
    assert!(client.run_tests(&payload(ScenarioId::Endless, "third"), &user()).await.is_ok());

    let running = client.running_tests(&user()).await.unwrap();
    let mut names: Vec<String> = running.into_keys().collect();
    names.sort();
    assert_eq!(names, vec!["second", "third"]);
    assert!(second.contains_key("second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submissions_spread_over_nodes() {
    let cluster = patient_cluster(3, 10).await;
    let client = cluster.client().await.unwrap();

    for i in 0..7 {
        client
            .run_tests(&payload(ScenarioId::Endless, &format!("run{}", i)), &user())
            .await
            .unwrap();
    }
    let loads: Vec<usize> = cluster.loads().await.into_iter().map(|l| l.simulations).collect();
    assert_eq!(loads.iter().sum::<usize>(), 7);
    let max = loads.iter().max().unwrap();
    let min = loads.iter().min().unwrap();
    assert!(max - min <= 1, "{:?}", loads);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ai_and_forced_stop() {
    let cluster = patient_cluster(1, 2).await;
    let client = cluster.client().await.unwrap();

    // Lane keeping without a waypoint in reach keeps asking the AI
    let mut bundle = ScenarioId::LaneKeeping.bundle();
    bundle.test.success = Evaluable::Unknown;
    bundle.environment.roads = vec![Road::straight("main", -10.0, 1_000_000.0, 0.0, 8.0)];
    let submitted = client
        .run_tests(&TestBundle::to_payload(&[bundle]).unwrap(), &user())
        .await
        .unwrap();
    let sid = submitted["lane_keeping"].clone();

    let ai = cluster.client().await.unwrap();
    let ai_sid = sid.clone();
    let driver = tokio::spawn(async move {
        let cruise = CruiseDriver::new(10.0, "speed").keeping_lane("angle");
        drive(&ai, &ai_sid, &VehicleId::new("ego"), &cruise).await
    });

    // Let a few turns pass, then succeed the test from outside
    tokio::time::sleep(Duration::from_millis(300)).await;
    let data = client
        .request_data(&sid, &VehicleId::new("ego"), &["speed", "bogus"])
        .await
        .unwrap();
    assert!(matches!(
        data.data["bogus"].value,
        Some(proto::data::Value::Error(ref void)) if void.message == "There is no request with ID \"bogus\"."
    ));

    client.stop(&sid, Verdict::Succeeded).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), driver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.final_state, SimState::Finished);
    assert!(summary.turns > 0);
    assert_eq!(client.result(&sid).await.unwrap(), Verdict::Succeeded);
}
