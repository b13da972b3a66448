use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use rand::Rng;
use serde::{Deserialize, Serialize};

use slotloader_service::Loader;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> Result<()> {
        for (i, workload) in self.workloads.iter().enumerate() {
            ensure!(workload.slots > 0, "workload {i}: needs at least one slot");
            ensure!(workload.keys > 0, "workload {i}: needs at least one key");
            ensure!(
                (0.0..=1.0).contains(&workload.failure_rate),
                "workload {i}: failure_rate must be between 0 and 1"
            );
        }
        Ok(())
    }
}

/// A simulated screen full of slots, scrolling through a set of keys.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of slots requesting resources.
    pub slots: usize,
    /// The number of distinct keys requested.
    pub keys: u64,
    /// How long a single load takes.
    #[serde(with = "humantime_serde")]
    pub load_time: Duration,
    /// The share of loads that fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// The size of each loaded resource, in bytes.
    #[serde(default = "default_resource_size")]
    pub resource_size: usize,
}

fn default_resource_size() -> usize {
    64 * 1024
}

/// A loader that blocks for a fixed time and then produces a buffer.
#[derive(Clone, Debug)]
pub struct SimulatedLoader {
    pub load_time: Duration,
    pub failure_rate: f64,
    pub resource_size: usize,
}

impl SimulatedLoader {
    pub fn new(workload: &Workload) -> Self {
        Self {
            load_time: workload.load_time,
            failure_rate: workload.failure_rate,
            resource_size: workload.resource_size,
        }
    }
}

impl Loader<u64, Vec<u8>> for SimulatedLoader {
    fn load(&self, key: &u64) -> Result<Option<Vec<u8>>> {
        thread::sleep(self.load_time);
        if rand::rng().random_bool(self.failure_rate) {
            return Err(anyhow!("simulated failure loading {key}"));
        }
        Ok(Some(vec![0; self.resource_size]))
    }
}
