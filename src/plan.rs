use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no interval in the stored plan covers the requested time")]
    NoCurrentInterval,
    #[error("optimisation plan is empty")]
    Empty,
    #[error("reading plan from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing plan to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding optimisation plan: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encoding optimisation plan: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Snapshot broadcast by the cloud optimiser. Field names follow the wire
/// format; missing fields decode to their zero values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisationPlan {
    pub site_id: String,
    pub optimisation_timestamp: OptimisationTimestamp,
    pub optimisation_intervals: Vec<OptimisationInterval>,
    pub setpoint_type: i32,
}

impl OptimisationPlan {
    /// An all-zero plan carries no information and is rejected at ingestion.
    pub fn is_empty(&self) -> bool {
        self.site_id.is_empty()
            && self.optimisation_timestamp.seconds == 0
            && self.optimisation_intervals.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisationTimestamp {
    pub seconds: i64,
    pub nanos: i64,
}

impl OptimisationTimestamp {
    fn epoch_nanos(&self) -> i128 {
        self.seconds as i128 * 1_000_000_000 + self.nanos as i128
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisationInterval {
    #[serde(rename = "optimisation_interval")]
    pub interval: OptimisationWindow,
    pub battery_power: OptimisationValue,
    pub state_of_charge: f32,
    pub meter_power: OptimisationValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisationWindow {
    pub start_time: OptimisationTimestamp,
    pub end_time: OptimisationTimestamp,
}

impl OptimisationWindow {
    /// Half-open containment: start inclusive, end exclusive.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.timestamp() as i128 * 1_000_000_000 + at.timestamp_subsec_nanos() as i128;
        self.start_time.epoch_nanos() <= t && t < self.end_time.epoch_nanos()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisationValue {
    pub value: f32,
    pub unit: i32,
}

/// Durable store for the latest optimisation plan: one JSON file, replaced
/// wholesale on every accepted plan message.
///
/// Writers are exclusive; readers are shared. The file is written to a
/// temporary sibling and renamed into place so a concurrent reader observes
/// either the previous or the new complete plan, never a torn one.
pub struct PlanStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, plan: &OptimisationPlan) -> Result<(), PlanError> {
        let encoded = serde_json::to_vec(plan).map_err(PlanError::Encode)?;
        let tmp = self.path.with_extension("tmp");

        let _guard = self.lock.write().unwrap();
        fs::write(&tmp, &encoded).map_err(|source| PlanError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| PlanError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn read(&self) -> Result<OptimisationPlan, PlanError> {
        let _guard = self.lock.read().unwrap();
        let raw = fs::read(&self.path).map_err(|source| PlanError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(PlanError::Decode)
    }

    /// First interval, in declared order, whose window contains `at`.
    pub fn current_interval(&self, at: DateTime<Utc>) -> Result<OptimisationInterval, PlanError> {
        let plan = self.read()?;
        plan.optimisation_intervals
            .into_iter()
            .find(|candidate| candidate.interval.contains(at))
            .ok_or(PlanError::NoCurrentInterval)
    }
}
