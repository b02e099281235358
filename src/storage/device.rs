use std::{cell::Cell, time::Duration};

use crate::{
    kernel::{Kernel, Resource},
    Op,
};

/// Latency model of a single physical device. Service time for an access of
/// `size_bytes` is `a + b * lbas`, with two corrections: chunk-sized accesses
/// on an HDD tier are striped across the tier's spindles, and writes pay the
/// device's write-amplification factor.
#[derive(Clone)]
pub struct DeviceProfile {
    pub a_ms: f64,
    pub b_per_lba_ms: f64,
    pub is_hdd: bool,
    pub parallel_factor: u32,
    pub write_amplification: f64,
    pub lba_size: u64,
    pub chunk_size: u64,
}

pub struct Device {
    name: String,
    kernel: Kernel,
    profile: DeviceProfile,
    // Capacity 1: a device serves one operation at a time, FIFO.
    queue: Resource,
    busy_time: Cell<Duration>,
    served: Cell<u64>,
}

impl Device {
    pub fn new(kernel: &Kernel, name: String, profile: DeviceProfile) -> Self {
        Device {
            name,
            kernel: kernel.clone(),
            queue: kernel.resource(1),
            profile,
            busy_time: Cell::new(Duration::ZERO),
            served: Cell::new(0),
        }
    }

    pub fn service_time(&self, size_bytes: u64, op: Op) -> Duration {
        let lbas = size_bytes.div_ceil(self.profile.lba_size);
        let mut ms = self.profile.a_ms + self.profile.b_per_lba_ms * lbas as f64;
        if self.profile.is_hdd && size_bytes == self.profile.chunk_size {
            ms /= f64::from(self.profile.parallel_factor);
        }
        if op == Op::Write {
            ms *= self.profile.write_amplification;
        }
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Waits for the device to become free, then occupies it for the service
    /// time of this access. Foreground I/O and migrations contend here on
    /// equal footing.
    pub async fn access(&self, size_bytes: u64, op: Op) {
        let service_time = self.service_time(size_bytes, op);
        let _slot = self.queue.acquire().await;
        self.kernel.timeout(service_time).await;
        self.busy_time.set(self.busy_time.get() + service_time);
        self.served.set(self.served.get() + 1);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn busy_time(&self) -> Duration {
        self.busy_time.get()
    }

    pub fn served(&self) -> u64 {
        self.served.get()
    }
}
