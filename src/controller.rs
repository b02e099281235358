use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crossbeam::channel::Sender;

use crate::{
    config::SimulationConfig,
    kernel::{Kernel, SimTime},
    logging::SimLog,
    orchestrator::Orchestrator,
    policy::{MigrationAction, Policy},
    stats::ResMsg,
    trace::stream::RequestStream,
    AccessLog,
};

/// Periodic driver of the placement policy. Every window it hands the policy
/// the accesses accumulated since the last decision, then executes the
/// returned commands one at a time, evictions ahead of promotions. A failed
/// command is counted and the window carries on.
pub struct MigrationController {
    kernel: Kernel,
    orchestrator: Rc<Orchestrator>,
    stream: Rc<RequestStream>,
    access_log: Rc<AccessLog>,
    policy: RefCell<Box<dyn Policy>>,
    window: SimTime,
    simulation_time: SimTime,
    executed: Cell<u64>,
    failed: Cell<u64>,
    results: Sender<ResMsg>,
    log: SimLog,
}

impl MigrationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel: Kernel,
        orchestrator: Rc<Orchestrator>,
        stream: Rc<RequestStream>,
        access_log: Rc<AccessLog>,
        policy: Box<dyn Policy>,
        sim: &SimulationConfig,
        log: SimLog,
        results: Sender<ResMsg>,
    ) -> Self {
        MigrationController {
            kernel,
            orchestrator,
            stream,
            access_log,
            policy: RefCell::new(policy),
            window: sim.window,
            simulation_time: sim.duration,
            executed: Cell::new(0),
            failed: Cell::new(0),
            results,
            log,
        }
    }

    pub async fn run(self: Rc<Self>) {
        self.log.line(self.kernel.now(), format_args!("started"));
        loop {
            self.kernel.timeout(self.window).await;
            let now = self.kernel.now();
            let window = self.access_log.take_window();
            self.log.line(
                now,
                format_args!("decision window, {} new access records", window.len()),
            );

            let commands = {
                let view = self.orchestrator.view();
                self.policy.borrow_mut().decide(now, &window, &view)
            };

            let (evictions, promotions): (Vec<_>, Vec<_>) = commands
                .into_iter()
                .partition(|command| matches!(command.action, MigrationAction::Evict));
            let mut executed = 0u64;
            let mut failed = 0u64;
            for command in evictions.into_iter().chain(promotions) {
                let ok = self
                    .orchestrator
                    .execute_migration(command.chunk, command.src, command.dst, command.reason)
                    .await;
                self.log.line(
                    self.kernel.now(),
                    format_args!(
                        "{:?} of chunk {} {}",
                        command.action,
                        command.chunk.0,
                        if ok { "succeeded" } else { "FAILED" }
                    ),
                );
                if ok {
                    executed += 1;
                } else {
                    failed += 1;
                }
            }
            self.executed.set(self.executed.get() + executed);
            self.failed.set(self.failed.get() + failed);
            self.results
                .send(ResMsg::Window {
                    now,
                    accesses: window.len() as u64,
                    executed,
                    failed,
                })
                .ok();

            if now > self.simulation_time
                && self.stream.completed() >= self.stream.generated()
            {
                self.log.line(
                    now,
                    format_args!("stopping, simulation time elapsed and all requests completed"),
                );
                break;
            }
            if now > self.simulation_time.mul_f64(1.1) {
                self.log.line(
                    now,
                    format_args!("force stop, simulation time exceeded by more than 10%"),
                );
                break;
            }
        }
        self.log.line(self.kernel.now(), format_args!("stopped"));
    }

    pub fn executed(&self) -> u64 {
        self.executed.get()
    }

    pub fn failed(&self) -> u64 {
        self.failed.get()
    }
}
