use std::collections::BTreeMap;

use priority_queue::DoublePriorityQueue;

use super::{lfu::FrequencyTable, MigrationCommand, Policy};
use crate::{
    kernel::SimTime, logging::SimLog, orchestrator::PlacementView, AccessRecord, Chunk,
};

const FAST: usize = 0;
const MID: usize = 1;
const SLOW: usize = 2;

/// LFU across a three-tier hierarchy. A first pass fills the fastest tier
/// like [`super::LfuPolicy`]; a second pass promotes backing-tier chunks into
/// the middle tier. Destinations planned earlier in the cycle are tracked so
/// a chunk is never planned twice and free space is estimated net of the
/// moves already queued.
pub struct TieredLfuPolicy {
    table: FrequencyTable,
    log: SimLog,
}

impl TieredLfuPolicy {
    pub fn new(total_chunks: u64, log: SimLog) -> Self {
        TieredLfuPolicy {
            table: FrequencyTable::new(total_chunks),
            log,
        }
    }
}

/// Free chunk slots once the pending moves in and out of `tier` settle.
fn effective_free(
    view: &PlacementView<'_>,
    tier: usize,
    pending: &BTreeMap<Chunk, usize>,
) -> i64 {
    let base = (view.free_space(tier) / view.chunk_size()) as i64;
    let mut incoming = 0i64;
    let mut outgoing = 0i64;
    for (chunk, dst) in pending {
        let current = view.tier_of(*chunk);
        if *dst == tier && current != Some(tier) {
            incoming += 1;
        }
        if current == Some(tier) && *dst != tier {
            outgoing += 1;
        }
    }
    base - incoming + outgoing
}

impl Policy for TieredLfuPolicy {
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
        if view.tier_count() < 3 {
            self.log.line(
                now,
                format_args!(
                    "WARNING: {} tiers configured, second pass needs three",
                    view.tier_count()
                ),
            );
        }

        let hot = self.table.hot_list();
        let mut pending: BTreeMap<Chunk, usize> = BTreeMap::new();
        let mut commands = Vec::new();

        // Pass 1: fill the fastest tier.
        let mut fast_lfu: DoublePriorityQueue<Chunk, (u64, u64)> = DoublePriorityQueue::new();
        for chunk in view.resident_chunks(FAST) {
            fast_lfu.push(chunk, self.table.heat_of(chunk));
        }
        for &(chunk, freq) in &hot {
            let Some(current) = view.tier_of(chunk) else {
                continue;
            };
            if current == FAST || pending.get(&chunk) == Some(&FAST) {
                continue;
            }
            if effective_free(view, FAST, &pending) > 0 {
                commands.push(MigrationCommand::promote(chunk, current, FAST));
                pending.insert(chunk, FAST);
                continue;
            }
            // Residents already promised a destination are off the table.
            let victim = loop {
                match fast_lfu.peek_min().map(|(chunk, heat)| (*chunk, *heat)) {
                    None => break None,
                    Some((victim, (victim_freq, _))) => {
                        if pending.contains_key(&victim) {
                            fast_lfu.pop_min();
                            continue;
                        }
                        break Some((victim, victim_freq));
                    }
                }
            };
            let Some((victim, victim_freq)) = victim else {
                break;
            };
            if freq > victim_freq {
                commands.push(MigrationCommand::evict(victim, FAST, MID));
                pending.insert(victim, MID);
                fast_lfu.pop_min();
                commands.push(MigrationCommand::promote(chunk, current, FAST));
                pending.insert(chunk, FAST);
            } else {
                break;
            }
        }

        // Pass 2: pull backing-tier chunks up into the middle tier.
        if view.tier_count() >= 3 {
            let mut mid_lfu: DoublePriorityQueue<Chunk, (u64, u64)> = DoublePriorityQueue::new();
            for chunk in view.resident_chunks(MID) {
                if pending.get(&chunk).map_or(true, |dst| *dst == MID) {
                    mid_lfu.push(chunk, self.table.heat_of(chunk));
                }
            }
            for (&chunk, &dst) in &pending {
                if dst == MID {
                    mid_lfu.push(chunk, self.table.heat_of(chunk));
                }
            }
            for &(chunk, freq) in &hot {
                let Some(current) = view.tier_of(chunk) else {
                    continue;
                };
                if current == FAST || current == MID {
                    continue;
                }
                if matches!(pending.get(&chunk), Some(&FAST) | Some(&MID)) {
                    continue;
                }
                if effective_free(view, MID, &pending) > 0 {
                    commands.push(MigrationCommand::promote(chunk, current, MID));
                    pending.insert(chunk, MID);
                    continue;
                }
                // Chunks promised to the fastest tier are not evictable here.
                let victim = loop {
                    match mid_lfu.peek_min().map(|(chunk, heat)| (*chunk, *heat)) {
                        None => break None,
                        Some((victim, (victim_freq, _))) => {
                            if pending.get(&victim) == Some(&FAST) {
                                mid_lfu.pop_min();
                                continue;
                            }
                            break Some((victim, victim_freq));
                        }
                    }
                };
                let Some((victim, victim_freq)) = victim else {
                    break;
                };
                if freq > victim_freq {
                    commands.push(MigrationCommand::evict(victim, MID, SLOW));
                    pending.insert(victim, SLOW);
                    mid_lfu.pop_min();
                    commands.push(MigrationCommand::promote(chunk, current, MID));
                    pending.insert(chunk, MID);
                } else {
                    break;
                }
            }
        }

        self.log.line(
            now,
            format_args!("{} migration commands for this window", commands.len()),
        );
        commands
    }
}
