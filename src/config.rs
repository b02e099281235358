use std::{path::PathBuf, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;

use crate::{policy::PolicyConfig, trace::TraceConfig, SimError};

#[derive(Deserialize)]
pub struct Config {
    pub policy: PolicyConfig,
    pub results: Results,
    pub simulation: SimulationConfig,
    pub trace: TraceConfig,
    pub tiers: Vec<TierConfig>,
}

#[derive(Deserialize)]
pub struct Results {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Clone)]
pub struct SimulationConfig {
    /// Upper bound of replayed virtual time.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// Interval between migration decision windows.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    #[serde(default = "default_lba_size")]
    pub lba_size: u64,
    /// Migration granularity in bytes.
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl SimulationConfig {
    pub fn lbas_per_chunk(&self) -> u64 {
        self.chunk_size / self.lba_size
    }
}

fn default_lba_size() -> u64 {
    512
}

#[derive(Deserialize, Clone)]
pub struct TierConfig {
    pub name: String,
    pub capacity: u64,
    /// Fixed latency share of one device access, in milliseconds.
    pub a_ms: f64,
    /// Variable latency per LBA, in milliseconds.
    pub b_per_lba_ms: f64,
    #[serde(default = "default_num_devices")]
    pub num_devices: usize,
    #[serde(default)]
    pub is_hdd: bool,
    /// Multiplier applied to write service times (2.0 approximates the
    /// measured slowdown of flash writes).
    #[serde(default = "default_write_amplification")]
    pub write_amplification: f64,
}

fn default_num_devices() -> usize {
    1
}

fn default_write_amplification() -> f64 {
    1.0
}

impl Config {
    pub fn validate(&self) -> Result<(), SimError> {
        let sim = &self.simulation;
        if sim.lba_size == 0 {
            return Err(SimError::InvalidConfig("lba_size must be positive".into()));
        }
        if sim.chunk_size == 0 || sim.chunk_size % sim.lba_size != 0 {
            return Err(SimError::InvalidConfig(
                "chunk_size must be a positive multiple of lba_size".into(),
            ));
        }
        if sim.total_chunks == 0 {
            return Err(SimError::InvalidConfig(
                "total_chunks must be positive".into(),
            ));
        }
        if self.tiers.len() < 2 {
            return Err(SimError::InvalidConfig(
                "at least two tiers are required".into(),
            ));
        }
        for tier in &self.tiers {
            if tier.num_devices == 0 {
                return Err(SimError::InvalidConfig(format!(
                    "tier {} needs at least one device",
                    tier.name
                )));
            }
            if tier.write_amplification <= 0.0 {
                return Err(SimError::InvalidConfig(format!(
                    "tier {} has a non-positive write_amplification",
                    tier.name
                )));
            }
        }
        // The backing tier holds every chunk at startup; a configuration it
        // cannot hold is rejected up front instead of warned about later.
        let bottom = self.tiers.last().expect("tiers checked non-empty");
        let initial_load = sim.total_chunks.saturating_mul(sim.chunk_size);
        if bottom.capacity < initial_load {
            return Err(SimError::InvalidConfig(format!(
                "bottom tier {} ({} B) cannot hold the initial population ({} B)",
                bottom.name, bottom.capacity, initial_load
            )));
        }
        self.trace.validate()?;
        Ok(())
    }
}
