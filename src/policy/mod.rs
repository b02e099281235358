use serde::Deserialize;
use strum::EnumIter;

use crate::{
    kernel::SimTime, logging::SimLog, orchestrator::PlacementView, AccessRecord, Chunk,
};

mod lfu;
mod noop;
mod tiered;

pub use lfu::LfuPolicy;
pub use noop::Noop;
pub use tiered::TieredLfuPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    Promote,
    Evict,
}

#[derive(Debug, Clone)]
pub struct MigrationCommand {
    pub action: MigrationAction,
    pub chunk: Chunk,
    pub src: usize,
    pub dst: usize,
    pub reason: &'static str,
}

impl MigrationCommand {
    pub fn promote(chunk: Chunk, src: usize, dst: usize) -> Self {
        MigrationCommand {
            action: MigrationAction::Promote,
            chunk,
            src,
            dst,
            reason: "promotion_by_policy",
        }
    }

    pub fn evict(chunk: Chunk, src: usize, dst: usize) -> Self {
        MigrationCommand {
            action: MigrationAction::Evict,
            chunk,
            src,
            dst,
            reason: "eviction_by_policy",
        }
    }
}

/// A data placement decision procedure, invoked once per decision window with
/// the accesses accumulated since the previous call and a read-only view of
/// the current placement. Returns the migrations it wants executed, paired
/// evictions ahead of the promotions they make room for.
pub trait Policy {
    fn decide(
        &mut self,
        now: SimTime,
        window: &[AccessRecord],
        view: &PlacementView<'_>,
    ) -> Vec<MigrationCommand>;
}

#[derive(Deserialize, EnumIter, Debug, Clone, Copy)]
pub enum PolicyConfig {
    /// Cumulative LFU promoting into the fastest tier.
    Lfu,
    /// LFU over three tiers with a second promotion pass.
    TieredLfu,
    Noop,
}

impl PolicyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyConfig::Lfu => "lfu",
            PolicyConfig::TieredLfu => "tiered_lfu",
            PolicyConfig::Noop => "noop",
        }
    }

    pub fn build(&self, total_chunks: u64, log: SimLog) -> Box<dyn Policy> {
        match self {
            PolicyConfig::Lfu => Box::new(LfuPolicy::new(total_chunks, log)),
            PolicyConfig::TieredLfu => Box::new(TieredLfuPolicy::new(total_chunks, log)),
            PolicyConfig::Noop => Box::new(Noop {}),
        }
    }
}
