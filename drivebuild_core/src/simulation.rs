//! Node-local state of one running or finished test.

use crate::criteria::{EvalContext, Evaluable};
use crate::rendezvous::RendezvousBarrier;
use crate::store::{TestRecord, TestStore, VerificationCycle};
use crate::simulator::SimulatorHandle;
use crate::testcase::{LoadError, LoadedTest, TestCase};
use crate::verification::{CriteriaEvaluation, Outcome, SimState, Verdict};
use chrono::{DateTime, Utc};
use drivebuild_env::proto::{self, Data, DataResponse};
use drivebuild_env::{SimulationId, VehicleId};
use prost::Message;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const NOT_RUNNING: &str = "The simulation does not run anymore.";

#[derive(Serialize)]
struct CriteriaDocument<'a> {
    precondition: &'a Evaluable,
    success: &'a Evaluable,
    failure: &'a Evaluable,
}

struct Terminal {
    outcome: Outcome,
    finished: DateTime<Utc>,
}

/// One test hosted by a node.
///
/// The outcome is written exactly once, either by the verification loop or
/// by an external stop. Whoever writes it also releases the simulator, the
/// rendezvous entries and the work directory.
pub struct Simulation {
    pub sid: SimulationId,
    pub case: TestCase,
    pub environment: String,
    pub username: Option<String>,
    pub simulator: SimulatorHandle,
    criteria: String,
    work_dir: PathBuf,
    started: DateTime<Utc>,
    terminal: Mutex<Option<Terminal>>,
    /// Flips to true once the terminal record is persisted
    settled: watch::Sender<bool>,
}

impl Simulation {
    /// Wraps a loaded, paused scenario and attaches every declared request.
    pub async fn start(
        sid: SimulationId,
        loaded: LoadedTest,
        username: Option<String>,
        work_dir: PathBuf,
        started: DateTime<Utc>,
    ) -> Result<Self, LoadError> {
        let LoadedTest {
            case,
            environment,
            simulator,
        } = loaded;
        std::fs::create_dir_all(&work_dir)?;

        let simulator = SimulatorHandle::new(simulator);
        for participant in &case.participants {
            for (rid, request) in &participant.requests {
                simulator.attach_sensor(&participant.id, rid, *request).await?;
            }
        }
        for (vid, request) in case.criteria_requests() {
            let rid = format!("criteria.{:?}", request);
            simulator.attach_sensor(&vid, &rid, request).await?;
        }

        let criteria = serde_json::to_string(&CriteriaDocument {
            precondition: &case.precondition,
            success: &case.success,
            failure: &case.failure,
        })
        .map_err(|e| LoadError::Invalid(format!("{}: {}", case.name, e)))?;

        debug!("Simulation {} prepared in {}", sid, work_dir.display());
        Ok(Self {
            sid,
            case,
            environment,
            username,
            simulator,
            criteria,
            work_dir,
            started,
            terminal: Mutex::new(None),
            settled: watch::Sender::new(false),
        })
    }

    fn terminal(&self) -> MutexGuard<'_, Option<Terminal>> {
        self.terminal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.terminal().is_none()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.terminal().as_ref().map(|t| t.outcome)
    }

    pub fn verdict(&self) -> Verdict {
        self.outcome().map_or(Verdict::Unknown, |o| o.verdict)
    }

    pub fn state(&self) -> SimState {
        self.outcome().map_or(SimState::Running, |o| o.state)
    }

    pub fn record(&self) -> TestRecord {
        let terminal = self.terminal();
        let (result, status, finished) = match terminal.as_ref() {
            Some(t) => (t.outcome.verdict, t.outcome.state, Some(t.finished)),
            None => (Verdict::Unknown, SimState::Running, None),
        };
        TestRecord {
            sid: self.sid.clone(),
            test_name: self.case.name.clone(),
            environment: self.environment.clone(),
            criteria: self.criteria.clone(),
            result,
            status,
            started: Some(self.started),
            finished,
            username: self.username.clone(),
        }
    }

    /// Evaluates all criteria against the last poll.
    pub async fn evaluate(&self) -> CriteriaEvaluation {
        let vehicles = self.simulator.cached().await;
        let ctx = EvalContext {
            running: self.is_running(),
            tick: self.simulator.current_tick().await,
            vehicles: &vehicles,
            roads: self.simulator.roads(),
        };
        CriteriaEvaluation {
            precondition: self.case.precondition.eval(&ctx),
            failure: self.case.failure.eval(&ctx),
            success: self.case.success.eval(&ctx),
        }
    }

    /// Answers named data requests of one vehicle from the sensor cache.
    pub async fn data_response(&self, vid: &VehicleId, rids: &[String]) -> DataResponse {
        let running = self.is_running();
        let state = self.simulator.cached_vehicle(vid).await;
        let requests = self.case.participant(vid).map(|p| &p.requests);

        let data = rids
            .iter()
            .map(|rid| {
                let value = match (running, requests.and_then(|r| r.get(rid)), &state) {
                    (false, _, _) => Data::error(NOT_RUNNING),
                    (true, None, _) => Data::error(format!("There is no request with ID \"{}\".", rid)),
                    (true, Some(_), None) => {
                        Data::error(format!("No sensor data of \"{}\" has been polled yet.", vid))
                    }
                    (true, Some(request), Some(state)) => request.read(state, self.simulator.roads()),
                };
                (rid.clone(), value)
            })
            .collect();
        DataResponse { data }
    }

    /// Persists one trace row per polled vehicle.
    pub async fn store_cycle(&self, store: &dyn TestStore, started: DateTime<Utc>, finished: DateTime<Utc>) {
        let tick = self.simulator.current_tick().await;
        let cache = self.simulator.cached().await;
        for participant in &self.case.participants {
            let Some(state) = cache.get(&participant.id) else {
                continue;
            };
            let response = DataResponse {
                data: participant
                    .requests
                    .iter()
                    .map(|(rid, request)| (rid.clone(), request.read(state, self.simulator.roads())))
                    .collect(),
            };
            let cycle = VerificationCycle {
                sid: self.sid.clone(),
                vid: participant.id.clone(),
                tick,
                data: response.encode_to_vec(),
                started,
                finished,
            };
            if let Err(e) = store.put_cycle(&cycle) {
                warn!("Storing cycle {}/{}@{} failed: {}", self.sid, participant.id, tick, e);
            }
        }
    }

    /// Moves the simulation into its terminal state.
    ///
    /// Returns false if another caller already did.
    pub async fn finish(
        &self,
        outcome: Outcome,
        finished: DateTime<Utc>,
        barrier: &RendezvousBarrier,
        store: &dyn TestStore,
    ) -> bool {
        let lost = {
            let mut terminal = self.terminal();
            if terminal.is_none() {
                *terminal = Some(Terminal { outcome, finished });
                None
            } else {
                Some(self.settled.subscribe())
            }
        };
        if let Some(mut settled) = lost {
            let _ = settled.wait_for(|settled| *settled).await;
            return false;
        }

        self.simulator.close().await;
        barrier.evict(&self.sid).await;
        if let Err(e) = store.put_test(&self.record()) {
            warn!("Persisting result of {} failed: {}", self.sid, e);
        }
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Removing {} failed: {}", self.work_dir.display(), e),
        }
        self.settled.send_replace(true);
        info!(
            "Simulation {} ({}) finished: {:?} / {:?}",
            self.sid, self.case.name, outcome.verdict, outcome.state
        );
        true
    }

    /// Waits until the winner of [`finish`](Self::finish) has persisted the
    /// terminal record.
    pub async fn wait_settled(&self) {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;
    }

    pub fn to_state_response(&self) -> proto::SimStateResponse {
        proto::SimStateResponse::with_state(self.state().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorRequest;
    use crate::store::SledTestStore;
    use crate::testcase::Participant;
    use crate::testing::ScriptedSimulator;
    use drivebuild_env::proto::data;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    async fn simulation(dir: &tempfile::TempDir) -> Simulation {
        let mut requests = BTreeMap::new();
        requests.insert("speed".to_string(), SensorRequest::Speed);
        requests.insert("pos".to_string(), SensorRequest::Position);
        let case = TestCase {
            name: "data".into(),
            authors: vec!["someone".into()],
            steps_per_second: 60,
            ai_frequency: 6,
            precondition: Evaluable::Unknown,
            success: Evaluable::Unknown,
            failure: Evaluable::Unknown,
            participants: vec![Participant {
                id: VehicleId::new("ego"),
                requests,
            }],
        };
        let loaded = LoadedTest {
            case,
            environment: "{\"roads\":[]}".into(),
            simulator: Box::new(ScriptedSimulator::with_speeds("ego", &[7.0])),
        };
        Simulation::start(SimulationId::new("3"), loaded, Some("alice".into()), dir.path().join("3"), Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_data_response_reads_cache() {
        let dir = tempfile::tempdir().unwrap();
        let sim = simulation(&dir).await;
        sim.simulator.poll_sensors().await.unwrap();

        let response = sim
            .data_response(&VehicleId::new("ego"), &["speed".into(), "nope".into()])
            .await;
        match &response.data["speed"].value {
            Some(data::Value::Speed(s)) => assert_eq!(s.speed, 7.0),
            other => panic!("unexpected {:?}", other),
        }
        match &response.data["nope"].value {
            Some(data::Value::Error(v)) => assert_eq!(v.message, "There is no request with ID \"nope\"."),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_losing_finish_waits_until_record_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulation(&dir).await);
        let store = Arc::new(SledTestStore::open_temp().unwrap());
        let barrier = RendezvousBarrier::new();

        let settled = tokio::spawn({
            let sim = sim.clone();
            async move { sim.wait_settled().await }
        });
        tokio::task::yield_now().await;
        assert!(!settled.is_finished());

        let (a, b) = tokio::join!(
            sim.finish(Outcome::from_verdict(Verdict::Failed), Utc::now(), &barrier, &*store),
            sim.finish(Outcome::from_verdict(Verdict::Succeeded), Utc::now(), &barrier, &*store),
        );
        assert!(a ^ b);
        tokio::time::timeout(Duration::from_secs(1), settled).await.unwrap().unwrap();

        // Either caller observes the record the winner wrote
        let record = store.test(&sim.sid).unwrap().unwrap();
        assert_eq!(record.result, sim.verdict());
        assert_eq!(record.status, SimState::Finished);
    }

    #[tokio::test]
    async fn test_finish_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let sim = simulation(&dir).await;
        let store = SledTestStore::open_temp().unwrap();
        let barrier = RendezvousBarrier::new();
        assert!(dir.path().join("3").exists());

        assert!(sim.finish(Outcome::from_verdict(Verdict::Failed), Utc::now(), &barrier, &store).await);
        assert!(!sim.finish(Outcome::from_verdict(Verdict::Succeeded), Utc::now(), &barrier, &store).await);
        assert_eq!(sim.verdict(), Verdict::Failed);
        assert_eq!(sim.state(), SimState::Finished);
        assert!(!dir.path().join("3").exists());

        let record = store.test(&sim.sid).unwrap().unwrap();
        assert_eq!(record.result, Verdict::Failed);
        assert_eq!(record.username.as_deref(), Some("alice"));
        assert!(record.criteria.contains("precondition"));

        let response = sim.data_response(&VehicleId::new("ego"), &["speed".into()]).await;
        match &response.data["speed"].value {
            Some(data::Value::Error(v)) => assert_eq!(v.message, NOT_RUNNING),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cycle_rows_contain_declared_requests() {
        let dir = tempfile::tempdir().unwrap();
        let sim = simulation(&dir).await;
        let store = SledTestStore::open_temp().unwrap();
        sim.simulator.poll_sensors().await.unwrap();
        sim.store_cycle(&store, Utc::now(), Utc::now()).await;

        let cycles = store.cycles(&sim.sid, None).unwrap();
        assert_eq!(cycles.len(), 1);
        let response = DataResponse::decode(cycles[0].data.as_slice()).unwrap();
        assert_eq!(response.data.len(), 2);
        assert!(response.data.contains_key("pos"));
    }
}
