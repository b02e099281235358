use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use thiserror::Error;

use crate::{
    config::{SimulationConfig, TierConfig},
    kernel::Kernel,
    Chunk, Op,
};

mod device;
pub use device::{Device, DeviceProfile};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("tier {tier} cannot hold chunk {chunk} during initial population")]
    InitialCapacity { tier: String, chunk: u64 },
}

/// Residency metadata for one chunk on one tier. `dirty` marks unflushed
/// writes; it is cleared only when a clean copy reaches the backing tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResidency {
    pub dirty: bool,
    pub size_bytes: u64,
}

/// A named group of devices with a shared capacity budget and a table of
/// resident chunks. The bottom tier is the backing store: it is populated
/// with every chunk at startup and exempt from the capacity bound.
pub struct Tier {
    name: String,
    index: usize,
    is_bottom: bool,
    capacity_bytes: u64,
    chunk_size: u64,
    used_bytes: Cell<u64>,
    devices: Vec<Device>,
    next_device: Cell<usize>,
    residency: RefCell<HashMap<Chunk, ChunkResidency>>,
    write_faults: Cell<bool>,
}

impl Tier {
    pub fn new(kernel: &Kernel, index: usize, is_bottom: bool, config: &TierConfig, sim: &SimulationConfig) -> Self {
        let parallel_factor = if config.is_hdd {
            config.num_devices as u32
        } else {
            1
        };
        let devices = (0..config.num_devices)
            .map(|i| {
                Device::new(
                    kernel,
                    format!("{}_dev{}", config.name, i),
                    DeviceProfile {
                        a_ms: config.a_ms,
                        b_per_lba_ms: config.b_per_lba_ms,
                        is_hdd: config.is_hdd,
                        parallel_factor,
                        write_amplification: config.write_amplification,
                        lba_size: sim.lba_size,
                        chunk_size: sim.chunk_size,
                    },
                )
            })
            .collect();
        Tier {
            name: config.name.clone(),
            index,
            is_bottom,
            capacity_bytes: config.capacity,
            chunk_size: sim.chunk_size,
            used_bytes: Cell::new(0),
            devices,
            next_device: Cell::new(0),
            residency: RefCell::new(HashMap::new()),
            write_faults: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.get()
    }

    pub fn chunk_count(&self) -> u64 {
        self.residency.borrow().len() as u64
    }

    pub fn has(&self, chunk: Chunk) -> bool {
        self.residency.borrow().contains_key(&chunk)
    }

    pub fn get_meta(&self, chunk: Chunk) -> Option<ChunkResidency> {
        self.residency.borrow().get(&chunk).cloned()
    }

    pub fn free_space(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes.get())
    }

    /// Places a chunk without any simulated I/O. Used for the startup
    /// population of the backing tier. Idempotent: an existing entry only has
    /// its dirty flag overwritten.
    pub fn add_initial(&self, chunk: Chunk, dirty: bool) -> Result<(), StorageError> {
        let mut residency = self.residency.borrow_mut();
        if let Some(meta) = residency.get_mut(&chunk) {
            meta.dirty = dirty;
            return Ok(());
        }
        if !self.is_bottom && self.free_space() < self.chunk_size {
            return Err(StorageError::InitialCapacity {
                tier: self.name.clone(),
                chunk: chunk.0,
            });
        }
        residency.insert(
            chunk,
            ChunkResidency {
                dirty,
                size_bytes: self.chunk_size,
            },
        );
        self.used_bytes.set(self.used_bytes.get() + self.chunk_size);
        Ok(())
    }

    /// Round-robin over this tier's devices; the cursor advances per call.
    pub fn get_device(&self) -> &Device {
        let idx = self.next_device.get();
        self.next_device.set((idx + 1) % self.devices.len());
        &self.devices[idx]
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Reads one full chunk from a device of this tier.
    pub async fn read_chunk(&self, chunk: Chunk) -> Option<ChunkResidency> {
        if !self.has(chunk) {
            log::warn!("tier {}: chunk {} not resident for read", self.name, chunk.0);
            return None;
        }
        self.get_device().access(self.chunk_size, Op::Read).await;
        self.get_meta(chunk)
    }

    /// Writes one full chunk to a device of this tier and records its
    /// residency. Fails without side effects when a new chunk does not fit.
    pub async fn write_chunk(&self, chunk: Chunk, dirty: bool) -> bool {
        if self.write_faults.get() {
            return false;
        }
        if !self.has(chunk) && self.free_space() < self.chunk_size {
            log::warn!("tier {}: full, cannot write new chunk {}", self.name, chunk.0);
            return false;
        }
        self.get_device().access(self.chunk_size, Op::Write).await;
        let mut residency = self.residency.borrow_mut();
        let previous = residency.insert(
            chunk,
            ChunkResidency {
                dirty,
                size_bytes: self.chunk_size,
            },
        );
        if previous.is_none() {
            self.used_bytes.set(self.used_bytes.get() + self.chunk_size);
        }
        true
    }

    /// Drops the residency entry and returns its metadata. Pure bookkeeping,
    /// no device I/O.
    pub fn remove_chunk(&self, chunk: Chunk) -> Option<ChunkResidency> {
        let removed = self.residency.borrow_mut().remove(&chunk);
        if let Some(meta) = &removed {
            self.used_bytes
                .set(self.used_bytes.get().saturating_sub(meta.size_bytes));
        }
        removed
    }

    pub fn set_dirty(&self, chunk: Chunk, dirty: bool) -> bool {
        match self.residency.borrow_mut().get_mut(&chunk) {
            Some(meta) => {
                meta.dirty = dirty;
                true
            }
            None => false,
        }
    }

    pub fn resident_chunks(&self) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self.residency.borrow().keys().copied().collect();
        chunks.sort();
        chunks
    }

    /// Makes every subsequent `write_chunk` fail. Exercises the rollback
    /// path, which the latency model alone cannot trigger.
    #[cfg(test)]
    pub fn set_write_faults(&self, on: bool) {
        self.write_faults.set(on);
    }
}
