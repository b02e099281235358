use std::path::PathBuf;

use serde::Deserialize;
use strum::EnumIter;
use thiserror::Error;

use crate::{config::SimulationConfig, Op};

pub mod stream;
mod synthetic;
pub use synthetic::SyntheticConfig;

/// Trace ingestion: each supported format yields raw records in the units the
/// trace was captured in; normalization brings them to the simulator's units
/// (milliseconds, LBAs, bytes) before replay.

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace file not found: {0}")]
    MissingFile(PathBuf),
    #[error("trace format {0:?} requires a path")]
    MissingPath(TraceFormat),
    #[error("synthetic trace selected but no [trace.synthetic] section given")]
    MissingSyntheticSection,
    #[error("invalid synthetic trace parameters: {0}")]
    InvalidSynthetic(String),
    #[error("could not open trace: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum TraceFormat {
    /// MSR Cambridge block traces: Windows filetime timestamps, byte offsets.
    Msr,
    /// SYSTOR '17 traces: unix-second timestamps, byte offsets.
    Systor17,
    /// `timestamp_ms,lba,size_bytes,op` rows, optionally with a header.
    GenericCsv,
    /// Zipf-distributed load generated in-process.
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampUnit {
    /// 100 ns Windows filetime ticks.
    WindowsFiletime,
    Seconds,
    Milliseconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    Bytes,
    Lba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    Blocks,
}

/// One trace line in its source units.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub raw_timestamp: f64,
    pub timestamp_unit: TimestampUnit,
    pub raw_offset: u64,
    pub offset_unit: OffsetUnit,
    pub raw_size: u64,
    pub size_unit: SizeUnit,
    pub op: String,
    pub hostname: Option<String>,
    pub disk_number: Option<u32>,
    pub response_time: Option<f64>,
}

/// A record in simulator units, ready for replay.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub timestamp_ms: f64,
    pub lba: u64,
    pub size_bytes: u64,
    pub op: Op,
}

pub fn normalize(raw: &RawRecord, lba_size: u64) -> TraceRecord {
    let timestamp_ms = match raw.timestamp_unit {
        TimestampUnit::WindowsFiletime => raw.raw_timestamp / 10_000.0,
        TimestampUnit::Seconds => raw.raw_timestamp * 1000.0,
        TimestampUnit::Milliseconds => raw.raw_timestamp,
    };
    let lba = match raw.offset_unit {
        OffsetUnit::Bytes => raw.raw_offset / lba_size,
        OffsetUnit::Lba => raw.raw_offset,
    };
    let size_bytes = match raw.size_unit {
        SizeUnit::Bytes => raw.raw_size,
        SizeUnit::Blocks => raw.raw_size * lba_size,
    };
    TraceRecord {
        timestamp_ms,
        lba,
        size_bytes,
        op: parse_op(&raw.op),
    }
}

fn parse_op(op: &str) -> Op {
    match op.trim().to_ascii_lowercase().as_str() {
        "read" | "r" | "rs" => Op::Read,
        "write" | "w" | "ws" => Op::Write,
        other => {
            log::warn!("unknown operation type {other:?}, defaulting to read");
            Op::Read
        }
    }
}

#[derive(Deserialize)]
pub struct TraceConfig {
    pub format: TraceFormat,
    pub path: Option<PathBuf>,
    /// Only meaningful for `GenericCsv`.
    #[serde(default)]
    pub has_header: bool,
    pub synthetic: Option<SyntheticConfig>,
}

impl TraceConfig {
    pub fn validate(&self) -> Result<(), TraceError> {
        match self.format {
            TraceFormat::Synthetic => {
                let synthetic = self
                    .synthetic
                    .as_ref()
                    .ok_or(TraceError::MissingSyntheticSection)?;
                synthetic.validate()
            }
            format => {
                let path = self
                    .path
                    .as_ref()
                    .ok_or(TraceError::MissingPath(format))?;
                if !path.exists() {
                    return Err(TraceError::MissingFile(path.clone()));
                }
                Ok(())
            }
        }
    }

    /// Opens the configured source as a normalized record iterator.
    /// Malformed lines are logged and skipped; they never abort a run.
    pub fn open(
        &self,
        sim: &SimulationConfig,
    ) -> Result<Box<dyn Iterator<Item = TraceRecord>>, TraceError> {
        let lba_size = sim.lba_size;
        if self.format == TraceFormat::Synthetic {
            let synthetic = self
                .synthetic
                .as_ref()
                .ok_or(TraceError::MissingSyntheticSection)?;
            let source = synthetic::ZipfTrace::new(synthetic, sim)?;
            return Ok(Box::new(source.map(move |raw| normalize(&raw, lba_size))));
        }
        let path = self
            .path
            .as_ref()
            .ok_or(TraceError::MissingPath(self.format))?;
        let has_header = match self.format {
            TraceFormat::GenericCsv => self.has_header,
            _ => false,
        };
        let reader = csv::ReaderBuilder::new()
            .has_headers(has_header)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let format = self.format;
        let iter = reader
            .into_records()
            .enumerate()
            .filter_map(move |(line, row)| match row {
                Ok(row) => {
                    let parsed = parse_row(format, &row);
                    if parsed.is_none() {
                        log::warn!("skipping malformed trace line {}", line + 1);
                    }
                    parsed
                }
                Err(e) => {
                    log::warn!("skipping unreadable trace line {}: {e}", line + 1);
                    None
                }
            })
            .map(move |raw| normalize(&raw, lba_size));
        Ok(Box::new(iter))
    }
}

fn parse_row(format: TraceFormat, row: &csv::StringRecord) -> Option<RawRecord> {
    match format {
        // Timestamp,Hostname,DiskNumber,Type,Offset,Size,ResponseTime
        TraceFormat::Msr => Some(RawRecord {
            raw_timestamp: row.get(0)?.parse().ok()?,
            timestamp_unit: TimestampUnit::WindowsFiletime,
            raw_offset: row.get(4)?.parse().ok()?,
            offset_unit: OffsetUnit::Bytes,
            raw_size: row.get(5)?.parse().ok()?,
            size_unit: SizeUnit::Bytes,
            op: row.get(3)?.to_string(),
            hostname: row.get(1).map(str::to_string),
            disk_number: row.get(2).and_then(|f| f.parse().ok()),
            response_time: row.get(6).and_then(|f| f.parse().ok()),
        }),
        // Timestamp,Response,IOType,LUN,Offset,Size
        TraceFormat::Systor17 => Some(RawRecord {
            raw_timestamp: row.get(0)?.parse().ok()?,
            timestamp_unit: TimestampUnit::Seconds,
            raw_offset: row.get(4)?.parse().ok()?,
            offset_unit: OffsetUnit::Bytes,
            raw_size: row.get(5)?.parse().ok()?,
            size_unit: SizeUnit::Bytes,
            op: row.get(2)?.to_string(),
            hostname: None,
            disk_number: row.get(3).and_then(|f| f.parse().ok()),
            response_time: row.get(1).and_then(|f| f.parse().ok()),
        }),
        // timestamp_ms,lba,size_bytes,op
        TraceFormat::GenericCsv => Some(RawRecord {
            raw_timestamp: row.get(0)?.parse().ok()?,
            timestamp_unit: TimestampUnit::Milliseconds,
            raw_offset: row.get(1)?.parse().ok()?,
            offset_unit: OffsetUnit::Lba,
            raw_size: row.get(2)?.parse().ok()?,
            size_unit: SizeUnit::Bytes,
            op: row.get(3)?.to_string(),
            hostname: None,
            disk_number: None,
            response_time: None,
        }),
        TraceFormat::Synthetic => None,
    }
}
