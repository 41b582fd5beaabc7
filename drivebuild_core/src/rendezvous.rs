//! Generation-counted barrier between AI clients and verification loops.
//!
//! For every (simulation, vehicle) pair two counters only ever grow:
//!
//! ```text
//!   AI client                          verification loop
//!   ─────────                          ─────────────────
//!   wait_for_simulator_request         request_ai_for
//!     ai_ready += 1  (generation N)      sim_ready += 1  (generation M)
//!     block until sim_ready >= N         block until ai_ready >= M
//! ```
//!
//! Waiters sleep on a `watch` channel and are woken by the counterpart's
//! increment, or by the simulation being marked finished, whichever
//! comes first.

use drivebuild_env::{SimulationId, VehicleId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Counter pair of one (simulation, vehicle) entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub sim_ready: u64,
    pub ai_ready: u64,
}

/// Why a blocked side was let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The counterpart reached the same generation
    Paired,
    /// The simulation is no longer running
    SimulationEnded,
}

struct SimulationGate {
    running: watch::Sender<bool>,
    pairs: Mutex<HashMap<VehicleId, Arc<watch::Sender<Counters>>>>,
}

impl SimulationGate {
    fn new(running: bool) -> Self {
        Self {
            running: watch::channel(running).0,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    async fn pair(&self, vid: &VehicleId) -> Arc<watch::Sender<Counters>> {
        let mut pairs = self.pairs.lock().await;
        pairs
            .entry(vid.clone())
            .or_insert_with(|| Arc::new(watch::channel(Counters::default()).0))
            .clone()
    }
}

/// Rendezvous entries of all simulations hosted by one node.
#[derive(Default)]
pub struct RendezvousBarrier {
    simulations: Mutex<HashMap<SimulationId, Arc<SimulationGate>>>,
}

impl RendezvousBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running simulation.
    pub async fn open(&self, sid: &SimulationId) {
        let mut simulations = self.simulations.lock().await;
        simulations
            .entry(sid.clone())
            .or_insert_with(|| Arc::new(SimulationGate::new(true)));
    }

    /// Marks a simulation as finished and releases everybody blocked on it.
    pub async fn finish(&self, sid: &SimulationId) {
        if let Some(gate) = self.gate(sid).await {
            gate.running.send_replace(false);
            debug!("Rendezvous of {} released", sid);
        }
    }

    /// Finishes a simulation and drops its entries.
    pub async fn evict(&self, sid: &SimulationId) {
        let gate = self.simulations.lock().await.remove(sid);
        if let Some(gate) = gate {
            gate.running.send_replace(false);
        }
    }

    pub async fn is_running(&self, sid: &SimulationId) -> bool {
        match self.gate(sid).await {
            Some(gate) => *gate.running.borrow(),
            None => false,
        }
    }

    /// Current counters of a pair, if it was ever touched.
    pub async fn counters(&self, sid: &SimulationId, vid: &VehicleId) -> Option<Counters> {
        let gate = self.gate(sid).await?;
        let pairs = gate.pairs.lock().await;
        pairs.get(vid).map(|pair| *pair.borrow())
    }

    /// AI side: announces readiness and blocks until the simulation wants
    /// to drive this vehicle.
    pub async fn wait_for_simulator_request(&self, sid: &SimulationId, vid: &VehicleId) -> Release {
        let Some(gate) = self.gate(sid).await else {
            return Release::SimulationEnded;
        };
        let pair = gate.pair(vid).await;
        let mut generation = 0;
        pair.send_modify(|c| {
            c.ai_ready += 1;
            generation = c.ai_ready;
        });
        debug!("AI {}/{} waiting at generation {}", sid, vid, generation);
        await_release(&gate, &pair, move |c| c.sim_ready >= generation).await
    }

    /// Simulation side: requests a control turn and blocks until the AI
    /// client has taken it.
    pub async fn request_ai_for(&self, sid: &SimulationId, vid: &VehicleId) -> Release {
        let Some(gate) = self.gate(sid).await else {
            return Release::SimulationEnded;
        };
        let pair = gate.pair(vid).await;
        let mut generation = 0;
        pair.send_modify(|c| {
            c.sim_ready += 1;
            generation = c.sim_ready;
        });
        debug!("Simulation {}/{} requesting AI at generation {}", sid, vid, generation);
        await_release(&gate, &pair, move |c| c.ai_ready >= generation).await
    }

    async fn gate(&self, sid: &SimulationId) -> Option<Arc<SimulationGate>> {
        self.simulations.lock().await.get(sid).cloned()
    }
}

async fn await_release<F>(gate: &SimulationGate, pair: &watch::Sender<Counters>, released: F) -> Release
where
    F: Fn(Counters) -> bool,
{
    let mut counters = pair.subscribe();
    let mut running = gate.running.subscribe();
    loop {
        if released(*counters.borrow_and_update()) {
            return Release::Paired;
        }
        if !*running.borrow_and_update() {
            return Release::SimulationEnded;
        }
        tokio::select! {
            changed = counters.changed() => if changed.is_err() { return Release::SimulationEnded },
            changed = running.changed() => if changed.is_err() { return Release::SimulationEnded },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const PROMPT: Duration = Duration::from_secs(2);

    fn ids() -> (SimulationId, VehicleId) {
        (SimulationId::new("1"), VehicleId::new("ego"))
    }

    #[tokio::test]
    async fn test_ai_first_then_simulation() {
        let barrier = Arc::new(RendezvousBarrier::new());
        let (sid, vid) = ids();
        barrier.open(&sid).await;

        let ai = {
            let barrier = barrier.clone();
            let (sid, vid) = (sid.clone(), vid.clone());
            tokio::spawn(async move { barrier.wait_for_simulator_request(&sid, &vid).await })
        };
        // AI side increments and blocks
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ai.is_finished());

        // Simulation finds the AI already waiting and passes immediately
        let sim = timeout(PROMPT, barrier.request_ai_for(&sid, &vid)).await.unwrap();
        assert_eq!(sim, Release::Paired);
        assert_eq!(timeout(PROMPT, ai).await.unwrap().unwrap(), Release::Paired);
        assert_eq!(
            barrier.counters(&sid, &vid).await,
            Some(Counters {
                sim_ready: 1,
                ai_ready: 1
            })
        );
    }

    #[tokio::test]
    async fn test_repeated_generations() {
        let barrier = Arc::new(RendezvousBarrier::new());
        let (sid, vid) = ids();
        barrier.open(&sid).await;

        let ai = {
            let barrier = barrier.clone();
            let (sid, vid) = (sid.clone(), vid.clone());
            tokio::spawn(async move {
                for _ in 0..5 {
                    assert_eq!(barrier.wait_for_simulator_request(&sid, &vid).await, Release::Paired);
                }
            })
        };
        for _ in 0..5 {
            let release = timeout(PROMPT, barrier.request_ai_for(&sid, &vid)).await.unwrap();
            assert_eq!(release, Release::Paired);
        }
        timeout(PROMPT, ai).await.unwrap().unwrap();
        let counters = barrier.counters(&sid, &vid).await.unwrap();
        assert_eq!(counters.sim_ready, 5);
        assert_eq!(counters.ai_ready, 5);
    }

    #[tokio::test]
    async fn test_finish_releases_blocked_simulation() {
        let barrier = Arc::new(RendezvousBarrier::new());
        let (sid, vid) = ids();
        barrier.open(&sid).await;

        let sim = {
            let barrier = barrier.clone();
            let (sid, vid) = (sid.clone(), vid.clone());
            tokio::spawn(async move { barrier.request_ai_for(&sid, &vid).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.finish(&sid).await;

        assert_eq!(timeout(PROMPT, sim).await.unwrap().unwrap(), Release::SimulationEnded);
        assert!(!barrier.is_running(&sid).await);
    }

    #[tokio::test]
    async fn test_waiting_on_finished_or_unknown_simulation_returns_promptly() {
        let barrier = RendezvousBarrier::new();
        let (sid, vid) = ids();

        let release = timeout(PROMPT, barrier.wait_for_simulator_request(&sid, &vid)).await.unwrap();
        assert_eq!(release, Release::SimulationEnded);

        barrier.open(&sid).await;
        barrier.finish(&sid).await;
        let release = timeout(PROMPT, barrier.wait_for_simulator_request(&sid, &vid)).await.unwrap();
        assert_eq!(release, Release::SimulationEnded);
    }

    #[tokio::test]
    async fn test_evict_releases_and_forgets() {
        let barrier = Arc::new(RendezvousBarrier::new());
        let (sid, vid) = ids();
        barrier.open(&sid).await;

        let ai = {
            let barrier = barrier.clone();
            let (sid, vid) = (sid.clone(), vid.clone());
            tokio::spawn(async move { barrier.wait_for_simulator_request(&sid, &vid).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.evict(&sid).await;

        assert_eq!(timeout(PROMPT, ai).await.unwrap().unwrap(), Release::SimulationEnded);
        assert!(barrier.counters(&sid, &vid).await.is_none());
    }

    #[tokio::test]
    async fn test_vehicles_are_independent() {
        let barrier = Arc::new(RendezvousBarrier::new());
        let sid = SimulationId::new("1");
        barrier.open(&sid).await;

        let other = {
            let barrier = barrier.clone();
            let sid = sid.clone();
            tokio::spawn(async move { barrier.request_ai_for(&sid, &VehicleId::new("other")).await })
        };
        let ai = {
            let barrier = barrier.clone();
            let sid = sid.clone();
            tokio::spawn(async move { barrier.wait_for_simulator_request(&sid, &VehicleId::new("ego")).await })
        };
        let release = timeout(PROMPT, barrier.request_ai_for(&sid, &VehicleId::new("ego"))).await.unwrap();
        assert_eq!(release, Release::Paired);
        timeout(PROMPT, ai).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!other.is_finished());
        barrier.finish(&sid).await;
        assert_eq!(timeout(PROMPT, other).await.unwrap().unwrap(), Release::SimulationEnded);
    }
}
