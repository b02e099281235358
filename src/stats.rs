use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::Duration,
};

use byte_unit::Byte;
use colored::Colorize;
use crossbeam::channel::{Receiver, Sender};
use human_repr::HumanDuration;

use crate::kernel::SimTime;

/// Collects measurements from the simulation on a channel and turns them into
/// csv files in the results directory plus a terminal summary. Runs on its
/// own OS thread so file I/O never blocks the event loop.

pub enum ResMsg {
    Requests {
        generated: u64,
        completed: u64,
        latencies: Vec<Duration>,
    },
    Window {
        now: SimTime,
        accesses: u64,
        executed: u64,
        failed: u64,
    },
    Tiers {
        tiers: Vec<TierReport>,
    },
    Devices {
        devices: Vec<DeviceReport>,
        total_runtime: Duration,
    },
    Simulator {
        total_runtime: Duration,
        migrations_executed: u64,
        migrations_failed: u64,
    },
    Done,
}

pub struct TierReport {
    pub name: String,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub chunks: u64,
}

pub struct DeviceReport {
    pub name: String,
    pub served: u64,
    pub busy_time: Duration,
}

pub struct ResultCollector {
    rx: Receiver<ResMsg>,
    requests: BufWriter<File>,
    windows: BufWriter<File>,
    tiers: BufWriter<File>,
    devices: BufWriter<File>,
}

fn csv_writer(path: &Path) -> Result<BufWriter<File>, std::io::Error> {
    Ok(BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?,
    ))
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl ResultCollector {
    pub fn new(path: &Path) -> Result<(Self, Sender<ResMsg>), std::io::Error> {
        let (tx, rx) = crossbeam::channel::unbounded();
        Ok((
            Self {
                rx,
                requests: csv_writer(&path.join("requests.csv"))?,
                windows: csv_writer(&path.join("windows.csv"))?,
                tiers: csv_writer(&path.join("tiers.csv"))?,
                devices: csv_writer(&path.join("devices.csv"))?,
            },
            tx,
        ))
    }

    pub fn main(mut self) -> Result<(), std::io::Error> {
        self.requests
            .write_fmt(format_args!("generated,completed,mean_ms,p95_ms\n"))?;
        self.windows
            .write_fmt(format_args!("now_ms,accesses,executed,failed\n"))?;
        self.tiers
            .write_fmt(format_args!("name,used_bytes,capacity_bytes,chunks\n"))?;
        self.devices
            .write_fmt(format_args!("name,served,busy_ms,utilization\n"))?;

        while let Ok(msg) = self.rx.recv() {
            match msg {
                ResMsg::Requests {
                    generated,
                    completed,
                    mut latencies,
                } => {
                    latencies.sort();
                    let mean =
                        latencies.iter().map(|d| ms(*d)).sum::<f64>() / latencies.len().max(1) as f64;
                    let p95 = latencies
                        .percentile(0.95)
                        .copied()
                        .unwrap_or(Duration::ZERO);
                    self.requests.write_fmt(format_args!(
                        "{generated},{completed},{mean},{}\n",
                        ms(p95)
                    ))?;
                    println!("{}", "Request statistics:".bold());
                    println!("\tGenerated: {generated}");
                    println!("\tCompleted: {completed}");
                    if completed > 0 {
                        println!("\tMean latency: {:.3} ms", mean);
                        println!("\tP95 latency: {:.3} ms", ms(p95));
                    }
                }
                ResMsg::Window {
                    now,
                    accesses,
                    executed,
                    failed,
                } => {
                    self.windows.write_fmt(format_args!(
                        "{},{accesses},{executed},{failed}\n",
                        ms(now)
                    ))?;
                }
                ResMsg::Tiers { tiers } => {
                    println!("{}", "Tier usage:".bold());
                    for tier in tiers.iter() {
                        self.tiers.write_fmt(format_args!(
                            "{},{},{},{}\n",
                            tier.name, tier.used_bytes, tier.capacity_bytes, tier.chunks
                        ))?;
                        println!(
                            "\t{}: {} / {} ({} chunks)",
                            tier.name,
                            Byte::from_bytes(u128::from(tier.used_bytes))
                                .get_appropriate_unit(true),
                            Byte::from_bytes(u128::from(tier.capacity_bytes))
                                .get_appropriate_unit(true),
                            tier.chunks,
                        );
                    }
                }
                ResMsg::Devices {
                    devices,
                    total_runtime,
                } => {
                    println!("{}", "Device statistics:".bold());
                    for dev in devices.iter() {
                        let utilization = if total_runtime.is_zero() {
                            0.0
                        } else {
                            dev.busy_time.as_secs_f64() / total_runtime.as_secs_f64()
                        };
                        self.devices.write_fmt(format_args!(
                            "{},{},{},{utilization}\n",
                            dev.name,
                            dev.served,
                            ms(dev.busy_time)
                        ))?;
                        println!(
                            "\t{}: {} requests, busy {}, utilization {:.2}%",
                            dev.name,
                            dev.served,
                            dev.busy_time.human_duration(),
                            utilization * 100.0,
                        );
                    }
                }
                ResMsg::Simulator {
                    total_runtime,
                    migrations_executed,
                    migrations_failed,
                } => {
                    println!(
                        "Runtime: {}, migrations: {} executed, {} failed",
                        total_runtime.human_duration(),
                        migrations_executed,
                        migrations_failed,
                    );
                }
                ResMsg::Done => break,
            }
        }
        self.requests.flush()?;
        self.windows.flush()?;
        self.tiers.flush()?;
        self.devices.flush()
    }
}

trait Percentile<T> {
    /// Assumes the vector is sorted.
    fn percentile(&self, p: f64) -> Option<&T>;
}

impl<T> Percentile<T> for Vec<T> {
    fn percentile(&self, p: f64) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        let cut_off = ((self.len() as f64 * p).ceil() as usize).min(self.len() - 1);
        self.get(cut_off)
    }
}
