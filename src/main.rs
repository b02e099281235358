/// Discrete-event simulator for a multi-tier block-storage system. An I/O
/// trace is replayed against a stack of heterogeneous tiers while a pluggable
/// policy periodically migrates fixed-size chunks between them; migrations
/// contend for the same device queues as the foreground requests, which is
/// exactly the effect under study.
use std::{
    cell::{Cell, RefCell},
    io::Read,
    path::PathBuf,
    process::ExitCode,
    rc::Rc,
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::{
    config::Config,
    controller::MigrationController,
    kernel::{Kernel, SimTime},
    logging::LogDir,
    orchestrator::Orchestrator,
    policy::PolicyConfig,
    stats::{DeviceReport, ResMsg, ResultCollector, TierReport},
    storage::{StorageError, Tier},
    trace::{stream::RequestStream, TraceError, TraceFormat},
};

mod config;
mod controller;
mod kernel;
mod logging;
mod orchestrator;
mod policy;
mod stats;
mod storage;
mod trace;
#[cfg(test)]
mod tests;

/// Identity of one migration unit, a run of contiguous LBAs.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Chunk(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// One submitted request as the policy layer sees it.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub at: SimTime,
    pub chunk: Chunk,
    pub op: Op,
    pub size_bytes: u64,
}

/// Shared append-only access log. The migration controller consumes it one
/// window at a time and consumption truncates, so the log never outgrows a
/// single window.
#[derive(Default)]
pub struct AccessLog {
    window: RefCell<Vec<AccessRecord>>,
    appended: Cell<u64>,
}

impl AccessLog {
    pub fn append(&self, record: AccessRecord) {
        self.window.borrow_mut().push(record);
        self.appended.set(self.appended.get() + 1);
    }

    pub fn take_window(&self) -> Vec<AccessRecord> {
        std::mem::take(&mut *self.window.borrow_mut())
    }

    pub fn total_appended(&self) -> u64 {
        self.appended.get()
    }
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("could not open or read configuration file: {source}")]
    CouldNotOpenConfig {
        #[from]
        source: std::io::Error,
    },
    #[error("error in configuration: {source}")]
    ConfigurationError {
        #[from]
        source: toml::de::Error,
    },
    #[error("configuration invariant violated: {0}")]
    InvalidConfig(String),
    #[error("{source}")]
    Trace {
        #[from]
        source: TraceError,
    },
    #[error("encountered fatal storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },
}

/// Core unit of the simulation: owns the kernel and all actors, drives the
/// event loop to completion and reports results.
struct Simulator {
    kernel: Kernel,
    orchestrator: Rc<Orchestrator>,
    stream: Rc<RequestStream>,
    controller: Rc<MigrationController>,
    simulation_time: SimTime,
    results_td: (
        std::thread::JoinHandle<Result<(), std::io::Error>>,
        crossbeam::channel::Sender<ResMsg>,
    ),
}

impl Simulator {
    fn assemble(config: Config, results: PathBuf) -> Result<Self, SimError> {
        let kernel = Kernel::new();
        let logs = LogDir::create(results.join("logs"))?;
        let (collector, tx) = ResultCollector::new(&results)?;
        let results_td = (std::thread::spawn(move || collector.main()), tx);

        let sim = config.simulation.clone();
        let bottom = config.tiers.len() - 1;
        let tiers: Vec<Tier> = config
            .tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| Tier::new(&kernel, index, index == bottom, tier, &sim))
            .collect();
        let orchestrator = Rc::new(Orchestrator::new(
            kernel.clone(),
            tiers,
            &sim,
            logs.component("orchestrator")?,
        )?);

        let access_log = Rc::new(AccessLog::default());
        let progress = ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner} {pos} requests issued|{per_sec}").unwrap(),
        );
        let stream = Rc::new(RequestStream::new(
            kernel.clone(),
            &sim,
            access_log.clone(),
            logs.component("request_stream")?,
            progress,
        ));
        orchestrator.set_request_stream(&stream);

        let policy = config.policy.build(
            sim.total_chunks,
            logs.component(&format!("policy_{}", config.policy.name()))?,
        );
        let controller = Rc::new(MigrationController::new(
            kernel.clone(),
            orchestrator.clone(),
            stream.clone(),
            access_log,
            policy,
            &sim,
            logs.component("migration_controller")?,
            results_td.1.clone(),
        ));

        let records = config.trace.open(&sim)?;
        {
            let stream = stream.clone();
            let orchestrator = orchestrator.clone();
            kernel.spawn(async move { stream.replay(orchestrator, records).await });
        }
        {
            let controller = controller.clone();
            kernel.spawn(async move { controller.run().await });
        }

        Ok(Simulator {
            kernel,
            orchestrator,
            stream,
            controller,
            simulation_time: sim.duration,
            results_td,
        })
    }

    fn run(self) -> Result<(), SimError> {
        // A guard past the nominal end lets in-flight work drain; the
        // controller stops itself well before this bound.
        self.kernel.run(Some(self.simulation_time.mul_f64(1.2)));
        let total_runtime = self.kernel.now();
        println!("{}", "Simulation finished.".green().bold());

        let tx = &self.results_td.1;
        tx.send(ResMsg::Requests {
            generated: self.stream.generated(),
            completed: self.stream.completed(),
            latencies: self.stream.latencies(),
        })
        .unwrap();
        tx.send(ResMsg::Tiers {
            tiers: self
                .orchestrator
                .tiers()
                .iter()
                .map(|tier| TierReport {
                    name: tier.name().to_string(),
                    used_bytes: tier.used_bytes(),
                    capacity_bytes: tier.capacity_bytes(),
                    chunks: tier.chunk_count(),
                })
                .collect(),
        })
        .unwrap();
        tx.send(ResMsg::Devices {
            devices: self
                .orchestrator
                .tiers()
                .iter()
                .flat_map(|tier| {
                    tier.devices().iter().map(|dev| DeviceReport {
                        name: dev.name().to_string(),
                        served: dev.served(),
                        busy_time: dev.busy_time(),
                    })
                })
                .collect(),
            total_runtime,
        })
        .unwrap();
        tx.send(ResMsg::Simulator {
            total_runtime,
            migrations_executed: self.controller.executed(),
            migrations_failed: self.controller.failed(),
        })
        .unwrap();
        tx.send(ResMsg::Done).unwrap();
        self.results_td.0.join().unwrap()?;
        Ok(())
    }
}

#[derive(Parser, Debug)]
struct SimCli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "List all available migration policies.")]
    Policies,
    #[command(about = "List all supported trace formats.")]
    Formats,
    #[command(about = "Run a tiered-storage migration simulation.")]
    Sim {
        #[arg(id = "CONFIG_PATH")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = faux_main() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn faux_main() -> Result<(), SimError> {
    let args = SimCli::parse();

    match args.cmd {
        Commands::Policies => {
            println!("Available policies:\n");
            for policy in PolicyConfig::iter() {
                println!("\t{policy:?}");
            }
            Ok(())
        }
        Commands::Formats => {
            println!("Supported trace formats:\n");
            for format in TraceFormat::iter() {
                println!("\t{format:?}");
            }
            Ok(())
        }
        Commands::Sim { config } => {
            let mut file = std::fs::OpenOptions::new().read(true).open(config)?;
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;

            // Append a suffix to avoid overwriting earlier results.
            let mut results = config
                .results
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from("./results"));
            let last = results
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("results"))
                .to_str()
                .unwrap_or("results")
                .to_string();
            let mut cur = 0;
            while results.exists() {
                let mut n = last.clone();
                n.push_str(&format!("_{}", cur));
                results.set_file_name(n);
                cur += 1;
            }
            std::fs::create_dir_all(&results)?;

            Simulator::assemble(config, results)?.run()
        }
    }
}
