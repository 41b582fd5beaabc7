//! Persistence of test records, verification-cycle traces and users.
//!
//! The persistence layer is a plain key-value store. [`SledTestStore`]
//! keeps three trees:
//!
//! - `tests`  : sid -> JSON [`TestRecord`]
//! - `cycles` : sid \0 vid \0 tick -> JSON [`VerificationCycle`]
//! - `users`  : username -> password

use crate::verification::{SimState, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drivebuild_env::{SimulationId, VehicleId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a test store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote allocation failed: {0}")]
    Remote(String),
}

/// One row per simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub sid: SimulationId,
    pub test_name: String,
    /// Serialized environment description
    pub environment: String,
    /// Serialized criteria of the test case
    pub criteria: String,
    pub result: Verdict,
    pub status: SimState,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub username: Option<String>,
}

/// One row per (simulation, vehicle, tick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCycle {
    pub sid: SimulationId,
    pub vid: VehicleId,
    pub tick: u64,
    /// Encoded `DataResponse` of every request declared for the vehicle
    pub data: Vec<u8>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// Query/insert access to persisted test state.
pub trait TestStore: Send + Sync {
    /// Allocates a fresh, never reused simulation id.
    fn next_sid(&self) -> Result<SimulationId, StoreError>;

    /// Inserts or replaces the record of a simulation.
    fn put_test(&self, record: &TestRecord) -> Result<(), StoreError>;

    fn test(&self, sid: &SimulationId) -> Result<Option<TestRecord>, StoreError>;

    fn put_cycle(&self, cycle: &VerificationCycle) -> Result<(), StoreError>;

    /// Cycles of a simulation ordered by vehicle and tick, optionally
    /// restricted to one vehicle.
    fn cycles(
        &self,
        sid: &SimulationId,
        vid: Option<&VehicleId>,
    ) -> Result<Vec<VerificationCycle>, StoreError>;

    fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError>;

    /// Boolean credential check.
    fn login_correct(&self, username: &str, password: &str) -> Result<bool, StoreError>;
}

/// Source of simulation ids for a node.
///
/// Ids are minted by the main application; a node either shares its store
/// or asks it over the wire.
#[async_trait]
pub trait SidAllocator: Send + Sync {
    async fn generate_sid(&self) -> Result<SimulationId, StoreError>;
}

/// Allocates ids straight from a store.
pub struct StoreSidAllocator {
    store: Arc<dyn TestStore>,
}

impl StoreSidAllocator {
    pub fn new(store: Arc<dyn TestStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SidAllocator for StoreSidAllocator {
    async fn generate_sid(&self) -> Result<SimulationId, StoreError> {
        self.store.next_sid()
    }
}

/// Sled-based persistent test store.
pub struct SledTestStore {
    db: sled::Db,
    tests: sled::Tree,
    cycles: sled::Tree,
    users: sled::Tree,
}

impl SledTestStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Self::from_db(db)
    }

    /// Open a temporary store (for testing)
    pub fn open_temp() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StoreError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StoreError::Storage(format!("Failed to open tree {}: {}", name, e)))
        };
        Ok(Self {
            tests: tree("tests")?,
            cycles: tree("cycles")?,
            users: tree("users")?,
            db,
        })
    }

    fn cycle_prefix(sid: &SimulationId, vid: Option<&VehicleId>) -> Vec<u8> {
        let mut key = format!("{}\0", sid).into_bytes();
        if let Some(vid) = vid {
            key.extend(format!("{}\0", vid).into_bytes());
        }
        key
    }
}

impl TestStore for SledTestStore {
    fn next_sid(&self) -> Result<SimulationId, StoreError> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| StoreError::Storage(format!("Id generation failed: {}", e)))?;
        // sled ids start at 0; keep sids positive
        Ok(SimulationId::new((id + 1).to_string()))
    }

    fn put_test(&self, record: &TestRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.tests
            .insert(record.sid.as_str(), value)
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        self.tests
            .flush()
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn test(&self, sid: &SimulationId) -> Result<Option<TestRecord>, StoreError> {
        let value = self
            .tests
            .get(sid.as_str())
            .map_err(|e| StoreError::Storage(format!("Lookup failed: {}", e)))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_cycle(&self, cycle: &VerificationCycle) -> Result<(), StoreError> {
        let mut key = Self::cycle_prefix(&cycle.sid, Some(&cycle.vid));
        key.extend(format!("{:020}", cycle.tick).into_bytes());
        let value = serde_json::to_vec(cycle)?;
        self.cycles
            .insert(key, value)
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    fn cycles(
        &self,
        sid: &SimulationId,
        vid: Option<&VehicleId>,
    ) -> Result<Vec<VerificationCycle>, StoreError> {
        self.cycles
            .scan_prefix(Self::cycle_prefix(sid, vid))
            .map(|entry| {
                let (_, value) =
                    entry.map_err(|e| StoreError::Storage(format!("Iteration failed: {}", e)))?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        self.users
            .insert(username, password.as_bytes())
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    fn login_correct(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let stored = self
            .users
            .get(username)
            .map_err(|e| StoreError::Storage(format!("Lookup failed: {}", e)))?;
        Ok(stored.map_or(false, |p| &p[..] == password.as_bytes()))
    }
}
