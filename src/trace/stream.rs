use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use indicatif::ProgressBar;

use super::TraceRecord;
use crate::{
    config::SimulationConfig,
    kernel::{Kernel, SimTime},
    logging::SimLog,
    orchestrator::Orchestrator,
    AccessLog, AccessRecord, Chunk,
};

/// One replayed I/O request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub arrival: SimTime,
    pub lba: u64,
    pub size_bytes: u64,
    pub op: crate::Op,
    pub completion: Option<SimTime>,
    pub latency: Option<Duration>,
}

/// Replays normalized trace records on the virtual clock, preserving their
/// inter-arrival gaps, and collects completion latencies.
pub struct RequestStream {
    kernel: Kernel,
    simulation_time: SimTime,
    lbas_per_chunk: u64,
    access_log: Rc<AccessLog>,
    generated: Cell<u64>,
    completed: Cell<u64>,
    latencies: RefCell<Vec<Duration>>,
    log: SimLog,
    progress: ProgressBar,
}

impl RequestStream {
    pub fn new(
        kernel: Kernel,
        sim: &SimulationConfig,
        access_log: Rc<AccessLog>,
        log: SimLog,
        progress: ProgressBar,
    ) -> Self {
        RequestStream {
            kernel,
            simulation_time: sim.duration,
            lbas_per_chunk: sim.lbas_per_chunk(),
            access_log,
            generated: Cell::new(0),
            completed: Cell::new(0),
            latencies: RefCell::new(Vec::new()),
            log,
            progress,
        }
    }

    /// Issues every record in trace order. The first record anchors the
    /// clock; each later one waits out its gap to the predecessor (clock
    /// skew backwards counts as zero). Submission stops once the nominal
    /// simulation time is exceeded.
    pub async fn replay(
        self: Rc<Self>,
        orchestrator: Rc<Orchestrator>,
        records: Box<dyn Iterator<Item = TraceRecord>>,
    ) {
        self.log.line(self.kernel.now(), format_args!("replay started"));
        let mut last_ts_ms: Option<f64> = None;
        let mut next_id = 0u64;
        for record in records {
            let wait_ms = match last_ts_ms {
                None => 0.0,
                Some(previous) => (record.timestamp_ms - previous).max(0.0),
            };
            last_ts_ms = Some(record.timestamp_ms);
            self.kernel.timeout(Duration::from_secs_f64(wait_ms / 1000.0)).await;

            next_id += 1;
            let now = self.kernel.now();
            let request = Request {
                id: next_id,
                arrival: now,
                lba: record.lba,
                size_bytes: record.size_bytes,
                op: record.op,
                completion: None,
                latency: None,
            };
            let chunk = Chunk(record.lba / self.lbas_per_chunk);
            self.access_log.append(AccessRecord {
                at: now,
                chunk,
                op: record.op,
                size_bytes: record.size_bytes,
            });
            self.generated.set(self.generated.get() + 1);
            self.progress.inc(1);
            let orch = Rc::clone(&orchestrator);
            self.kernel.spawn(async move { orch.handle_io(request).await });

            if now > self.simulation_time {
                self.log.line(
                    now,
                    format_args!("simulation time limit reached, stopping replay"),
                );
                break;
            }
        }
        self.progress.finish();
        self.log.line(
            self.kernel.now(),
            format_args!("replay finished, {} requests generated", self.generated.get()),
        );
    }

    /// Completion callback invoked by the orchestrator.
    pub fn complete(&self, mut request: Request) {
        let now = self.kernel.now();
        request.completion = Some(now);
        let latency = now - request.arrival;
        request.latency = Some(latency);
        self.latencies.borrow_mut().push(latency);
        self.completed.set(self.completed.get() + 1);
    }

    pub fn generated(&self) -> u64 {
        self.generated.get()
    }

    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    pub fn latencies(&self) -> Vec<Duration> {
        self.latencies.borrow().clone()
    }
}
