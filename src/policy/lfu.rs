use std::collections::{hash_map::Entry, HashMap};

use priority_queue::DoublePriorityQueue;

use super::{MigrationCommand, Policy};
use crate::{
    kernel::SimTime, logging::SimLog, orchestrator::PlacementView, AccessRecord, Chunk,
};

struct Heat {
    count: u64,
    /// Arrival rank of the first access, for stable ordering among equals.
    first_seen: u64,
}

/// Cumulative per-chunk access counts, kept across all windows.
pub(super) struct FrequencyTable {
    freq: HashMap<Chunk, Heat>,
    arrivals: u64,
    total_chunks: u64,
}

impl FrequencyTable {
    pub(super) fn new(total_chunks: u64) -> Self {
        FrequencyTable {
            freq: HashMap::new(),
            arrivals: 0,
            total_chunks,
        }
    }

    pub(super) fn absorb(&mut self, now: SimTime, window: &[AccessRecord], log: &SimLog) {
        for record in window {
            if record.chunk.0 >= self.total_chunks {
                log.line(
                    now,
                    format_args!(
                        "WARNING: access to out-of-range chunk {}, discarded",
                        record.chunk.0
                    ),
                );
                continue;
            }
            match self.freq.entry(record.chunk) {
                Entry::Occupied(mut occupied) => occupied.get_mut().count += 1,
                Entry::Vacant(vacant) => {
                    vacant.insert(Heat {
                        count: 1,
                        first_seen: self.arrivals,
                    });
                    self.arrivals += 1;
                }
            }
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.freq.is_empty()
    }

    /// All chunks with frequency information, hottest first; ties keep
    /// first-seen order.
    pub(super) fn hot_list(&self) -> Vec<(Chunk, u64)> {
        let mut hot: Vec<(Chunk, u64, u64)> = self
            .freq
            .iter()
            .map(|(chunk, heat)| (*chunk, heat.count, heat.first_seen))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        hot.into_iter().map(|(chunk, count, _)| (chunk, count)).collect()
    }

    /// Coldest-first ordering key. Never-accessed chunks sort before any
    /// accessed one.
    pub(super) fn heat_of(&self, chunk: Chunk) -> (u64, u64) {
        self.freq
            .get(&chunk)
            .map(|heat| (heat.count, heat.first_seen))
            .unwrap_or((0, u64::MAX))
    }
}

/// Least-frequently-used promotion into the fastest tier. When tier 0 is
/// full, its coldest resident yields its slot to any strictly hotter
/// candidate; once the hottest remaining candidate loses that comparison, no
/// colder one can win and the pass ends.
pub struct LfuPolicy {
    table: FrequencyTable,
    log: SimLog,
}

impl LfuPolicy {
    pub fn new(total_chunks: u64, log: SimLog) -> Self {
        LfuPolicy {
            table: FrequencyTable::new(total_chunks),
            log,
        }
    }
}

impl Policy for LfuPolicy {
    fn decide(
        &mut self,
        now: SimTime,
        window: &[AccessRecord],
        view: &PlacementView<'_>,
    ) -> Vec<MigrationCommand> {
        self.log.line(
            now,
            format_args!("evaluating window of {} access records", window.len()),
        );
        self.table.absorb(now, window, &self.log);
        if self.table.is_empty() {
            return Vec::new();
        }

        // Tier-0 residents ordered coldest-first.
        let mut tier0_lfu: DoublePriorityQueue<Chunk, (u64, u64)> = DoublePriorityQueue::new();
        for chunk in view.resident_chunks(0) {
            tier0_lfu.push(chunk, self.table.heat_of(chunk));
        }

        let chunk_size = view.chunk_size();
        let mut commands = Vec::new();
        for (chunk, freq) in self.table.hot_list() {
            let Some(current) = view.tier_of(chunk) else {
                self.log.line(
                    now,
                    format_args!("WARNING: chunk {} missing from placement, skipped", chunk.0),
                );
                continue;
            };
            if current == 0 {
                continue;
            }
            if view.free_space(0) >= chunk_size {
                self.log.line(
                    now,
                    format_args!("promote chunk {} (freq {freq}) from tier {current}", chunk.0),
                );
                commands.push(MigrationCommand::promote(chunk, current, 0));
                continue;
            }
            let Some((victim, (victim_freq, _))) =
                tier0_lfu.peek_min().map(|(chunk, heat)| (*chunk, *heat))
            else {
                self.log.line(
                    now,
                    format_args!("WARNING: tier 0 full but holds no eviction candidates"),
                );
                continue;
            };
            if victim_freq < freq {
                self.log.line(
                    now,
                    format_args!(
                        "tier 0 full, evict chunk {} (freq {victim_freq}) for chunk {} (freq {freq})",
                        victim.0, chunk.0
                    ),
                );
                commands.push(MigrationCommand::evict(victim, 0, 1));
                commands.push(MigrationCommand::promote(chunk, current, 0));
                tier0_lfu.pop_min();
            } else {
                // The hottest remaining candidate cannot displace anyone.
                break;
            }
        }
        self.log.line(
            now,
            format_args!("{} migration commands for this window", commands.len()),
        );
        commands
    }
}
