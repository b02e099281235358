use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use crate::{
    config::SimulationConfig,
    kernel::{Kernel, Resource},
    logging::SimLog,
    storage::{StorageError, Tier},
    trace::stream::{Request, RequestStream},
    Chunk, Op,
};

/// Authoritative owner of chunk placement. Routes foreground I/O to the
/// resident tier and executes migrations as detach/place pairs with rollback.
///
/// The placement map is the single source of truth for chunk locations;
/// per-tier residency tables carry only the metadata. Both are mutated
/// between suspension points only, so concurrent tasks always observe
/// consistent snapshots. On top of that, a per-chunk lock serializes I/O
/// and migration touching the same chunk: without it a request could catch
/// a chunk mid-migration, after detach and before the destination write
/// lands.
pub struct Orchestrator {
    kernel: Kernel,
    tiers: Vec<Tier>,
    placement: RefCell<Vec<usize>>,
    chunk_locks: RefCell<HashMap<Chunk, Resource>>,
    stream: RefCell<Weak<RequestStream>>,
    chunk_size: u64,
    lbas_per_chunk: u64,
    log: SimLog,
}

impl Orchestrator {
    /// Builds the placement map and synchronously populates the backing tier
    /// with every chunk, clean. No simulated time elapses here.
    pub fn new(
        kernel: Kernel,
        tiers: Vec<Tier>,
        sim: &SimulationConfig,
        log: SimLog,
    ) -> Result<Self, StorageError> {
        let bottom = tiers.len() - 1;
        log.line(
            kernel.now(),
            format_args!("populating bottom tier {} with {} chunks", tiers[bottom].name(), sim.total_chunks),
        );
        for chunk in 0..sim.total_chunks {
            tiers[bottom].add_initial(Chunk(chunk), false)?;
        }
        log.line(kernel.now(), format_args!("initial population finished"));
        Ok(Orchestrator {
            kernel,
            tiers,
            placement: RefCell::new(vec![bottom; sim.total_chunks as usize]),
            chunk_locks: RefCell::new(HashMap::new()),
            stream: RefCell::new(Weak::new()),
            chunk_size: sim.chunk_size,
            lbas_per_chunk: sim.lbas_per_chunk(),
            log,
        })
    }

    /// Wires the completion callback.
    pub fn set_request_stream(&self, stream: &Rc<RequestStream>) {
        *self.stream.borrow_mut() = Rc::downgrade(stream);
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn bottom(&self) -> usize {
        self.tiers.len() - 1
    }

    pub fn tier_of(&self, chunk: Chunk) -> Option<usize> {
        self.placement.borrow().get(chunk.0 as usize).copied()
    }

    pub fn view(&self) -> PlacementView<'_> {
        PlacementView { orchestrator: self }
    }

    fn chunk_lock(&self, chunk: Chunk) -> Resource {
        self.chunk_locks
            .borrow_mut()
            .entry(chunk)
            .or_insert_with(|| self.kernel.resource(1))
            .clone()
    }

    fn complete(&self, request: Request) {
        if let Some(stream) = self.stream.borrow().upgrade() {
            stream.complete(request);
        }
    }

    /// Serves one replayed request on the device of its resident tier. A
    /// chunk found in no tier is a broken invariant: the request is logged as
    /// completed without device work so the replay can continue.
    pub async fn handle_io(&self, request: Request) {
        let chunk = Chunk(request.lba / self.lbas_per_chunk);
        let _chunk_guard = self.chunk_lock(chunk).acquire().await;
        let resident = self
            .tier_of(chunk)
            .filter(|&tier| self.tiers[tier].has(chunk));
        let Some(tier_idx) = resident else {
            self.log.line(
                self.kernel.now(),
                format_args!(
                    "CRITICAL: chunk {} (LBA {}) not resident in any tier, completing request {} without device work",
                    chunk.0, request.lba, request.id
                ),
            );
            self.complete(request);
            return;
        };
        debug_assert_eq!(
            self.tiers.iter().filter(|tier| tier.has(chunk)).count(),
            1,
            "chunk {} resident in more than one tier",
            chunk.0
        );
        let tier = &self.tiers[tier_idx];
        tier.get_device().access(request.size_bytes, request.op).await;
        if request.op == Op::Write {
            tier.set_dirty(chunk, true);
        }
        self.complete(request);
    }

    /// Moves one chunk between tiers. Returns false on any precondition
    /// mismatch, leaving state untouched; a failed destination write is
    /// rolled back onto the source tier.
    ///
    /// A clean chunk evicted down to the backing tier needs no physical
    /// write: the backing copy is still valid, only the flag and the
    /// placement map are refreshed.
    pub async fn execute_migration(
        &self,
        chunk: Chunk,
        src: usize,
        dst: usize,
        reason: &str,
    ) -> bool {
        let _chunk_guard = self.chunk_lock(chunk).acquire().await;
        let now = self.kernel.now();
        self.log.line(
            now,
            format_args!("migration ({reason}): chunk {} tier {src} -> tier {dst}", chunk.0),
        );
        if src >= self.tiers.len() || dst >= self.tiers.len() {
            self.log.line(now, format_args!("ERROR: invalid tier index, aborting"));
            return false;
        }
        if self.tier_of(chunk) != Some(src) {
            self.log.line(
                now,
                format_args!(
                    "ERROR: chunk {} location mismatch, placement says {:?}, migration says {src}",
                    chunk.0,
                    self.tier_of(chunk)
                ),
            );
            return false;
        }
        let src_tier = &self.tiers[src];
        let dst_tier = &self.tiers[dst];
        if !src_tier.has(chunk) {
            self.log.line(
                now,
                format_args!("ERROR: chunk {} missing from {}", chunk.0, src_tier.name()),
            );
            return false;
        }
        let to_bottom = dst == self.bottom();
        if !to_bottom && dst_tier.free_space() < self.chunk_size {
            self.log.line(
                now,
                format_args!("DENIED: {} has no space for chunk {}", dst_tier.name(), chunk.0),
            );
            return false;
        }

        let Some(meta) = src_tier.remove_chunk(chunk) else {
            return false;
        };

        if to_bottom && !meta.dirty && src < dst {
            if dst_tier.has(chunk) {
                dst_tier.set_dirty(chunk, false);
            } else if let Err(e) = dst_tier.add_initial(chunk, false) {
                self.log.line(now, format_args!("CRITICAL: {e}"));
            }
            self.placement.borrow_mut()[chunk.0 as usize] = dst;
            self.log.line(
                now,
                format_args!("clean chunk {} evicted to {} without device work", chunk.0, dst_tier.name()),
            );
            return true;
        }

        let write_dirty = if to_bottom { false } else { meta.dirty };
        if dst_tier.write_chunk(chunk, write_dirty).await {
            self.placement.borrow_mut()[chunk.0 as usize] = dst;
            self.log.line(
                self.kernel.now(),
                format_args!("chunk {} now resident in {}", chunk.0, dst_tier.name()),
            );
            return true;
        }

        self.log.line(
            self.kernel.now(),
            format_args!(
                "write of chunk {} to {} failed, rolling back to {}",
                chunk.0,
                dst_tier.name(),
                src_tier.name()
            ),
        );
        if src_tier.write_chunk(chunk, meta.dirty).await {
            self.log.line(
                self.kernel.now(),
                format_args!("rollback restored chunk {} to {}", chunk.0, src_tier.name()),
            );
        } else {
            self.log.line(
                self.kernel.now(),
                format_args!(
                    "CRITICAL: rollback of chunk {} to {} failed, state inconsistent",
                    chunk.0,
                    src_tier.name()
                ),
            );
        }
        false
    }
}

/// Read-only projection of tiers and placement handed to policies.
pub struct PlacementView<'a> {
    orchestrator: &'a Orchestrator,
}

impl PlacementView<'_> {
    pub fn tier_count(&self) -> usize {
        self.orchestrator.tiers.len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.orchestrator.chunk_size
    }

    pub fn tier_of(&self, chunk: Chunk) -> Option<usize> {
        self.orchestrator.tier_of(chunk)
    }

    pub fn free_space(&self, tier: usize) -> u64 {
        self.orchestrator.tiers[tier].free_space()
    }

    /// Chunks currently resident on a tier, in ascending chunk order.
    pub fn resident_chunks(&self, tier: usize) -> Vec<Chunk> {
        self.orchestrator.tiers[tier].resident_chunks()
    }
}
