use rand::{distributions::Distribution, rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use zipf::ZipfDistribution;

use super::{OffsetUnit, RawRecord, SizeUnit, TimestampUnit, TraceError};
use crate::config::SimulationConfig;

/// Zipf-distributed request generator, for experiments without a trace file.
/// A fixed seed makes runs reproducible.
#[derive(Deserialize, Debug, Clone)]
pub struct SyntheticConfig {
    pub requests: u64,
    /// Zipf skew; larger means a hotter head.
    pub theta: f64,
    #[serde(default)]
    pub seed: u64,
    /// Probability that a generated request is a read.
    #[serde(default = "default_read_ratio")]
    pub read_ratio: f64,
    /// Inter-arrival gap between consecutive requests.
    pub interval_ms: f64,
    pub request_size: u64,
}

fn default_read_ratio() -> f64 {
    0.5
}

impl SyntheticConfig {
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.theta <= 0.0 {
            return Err(TraceError::InvalidSynthetic("theta must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.read_ratio) {
            return Err(TraceError::InvalidSynthetic(
                "read_ratio must lie in [0, 1]".into(),
            ));
        }
        if self.interval_ms < 0.0 {
            return Err(TraceError::InvalidSynthetic(
                "interval_ms must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

pub struct ZipfTrace {
    remaining: u64,
    timestamp_ms: f64,
    interval_ms: f64,
    request_size: u64,
    read_ratio: f64,
    lbas_per_chunk: u64,
    dist: ZipfDistribution,
    rng: StdRng,
}

impl ZipfTrace {
    pub fn new(config: &SyntheticConfig, sim: &SimulationConfig) -> Result<Self, TraceError> {
        let dist = ZipfDistribution::new(sim.total_chunks as usize, config.theta)
            .map_err(|()| TraceError::InvalidSynthetic("zipf rejected total_chunks/theta".into()))?;
        Ok(ZipfTrace {
            remaining: config.requests,
            timestamp_ms: 0.0,
            interval_ms: config.interval_ms,
            request_size: config.request_size,
            read_ratio: config.read_ratio,
            lbas_per_chunk: sim.lbas_per_chunk(),
            dist,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }
}

impl Iterator for ZipfTrace {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // Zipf samples are 1-based ranks.
        let chunk = self.dist.sample(&mut self.rng) as u64 - 1;
        let op = if self.rng.gen_bool(self.read_ratio) {
            "read"
        } else {
            "write"
        };
        let record = RawRecord {
            raw_timestamp: self.timestamp_ms,
            timestamp_unit: TimestampUnit::Milliseconds,
            raw_offset: chunk * self.lbas_per_chunk,
            offset_unit: OffsetUnit::Lba,
            raw_size: self.request_size,
            size_unit: SizeUnit::Bytes,
            op: op.to_string(),
            hostname: None,
            disk_number: None,
            response_time: None,
        };
        self.timestamp_ms += self.interval_ms;
        Some(record)
    }
}
