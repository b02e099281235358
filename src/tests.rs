use std::{cell::Cell, rc::Rc, time::Duration};

use indicatif::ProgressBar;

use crate::{
    config::{SimulationConfig, TierConfig},
    controller::MigrationController,
    kernel::Kernel,
    logging::SimLog,
    orchestrator::Orchestrator,
    policy::{LfuPolicy, MigrationAction, Policy, PolicyConfig, TieredLfuPolicy},
    storage::Tier,
    trace::{
        stream::{Request, RequestStream},
        TraceRecord,
    },
    AccessLog, AccessRecord, Chunk, Op,
};

const LBA_SIZE: u64 = 512;
const CHUNK_SIZE: u64 = 4096;
const LBAS_PER_CHUNK: u64 = CHUNK_SIZE / LBA_SIZE;

fn sim_config(total_chunks: u64) -> SimulationConfig {
    SimulationConfig {
        duration: Duration::from_millis(1000),
        window: Duration::from_millis(100),
        lba_size: LBA_SIZE,
        chunk_size: CHUNK_SIZE,
        total_chunks,
    }
}

fn tier(name: &str, capacity: u64, a_ms: f64, b_per_lba_ms: f64) -> TierConfig {
    TierConfig {
        name: name.into(),
        capacity,
        a_ms,
        b_per_lba_ms,
        num_devices: 1,
        is_hdd: false,
        write_amplification: 1.0,
    }
}

/// Two bounded tiers over an effectively unbounded backing store.
fn reference_tiers() -> Vec<TierConfig> {
    vec![
        tier("t0", 8192, 0.0, 0.1),
        tier("t1", 8192, 1.0, 0.1),
        tier("t2", 1 << 30, 10.0, 0.01),
    ]
}

fn read(ts: f64, lba: u64) -> TraceRecord {
    TraceRecord {
        timestamp_ms: ts,
        lba,
        size_bytes: CHUNK_SIZE,
        op: Op::Read,
    }
}

fn write(ts: f64, lba: u64) -> TraceRecord {
    TraceRecord {
        timestamp_ms: ts,
        lba,
        size_bytes: CHUNK_SIZE,
        op: Op::Write,
    }
}

fn access(chunk: Chunk, op: Op) -> AccessRecord {
    AccessRecord {
        at: Duration::ZERO,
        chunk,
        op,
        size_bytes: CHUNK_SIZE,
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn storage_fixture(
    tier_configs: Vec<TierConfig>,
    total_chunks: u64,
) -> (Kernel, Rc<Orchestrator>) {
    let kernel = Kernel::new();
    let sim = sim_config(total_chunks);
    let bottom = tier_configs.len() - 1;
    let tiers: Vec<Tier> = tier_configs
        .iter()
        .enumerate()
        .map(|(index, config)| Tier::new(&kernel, index, index == bottom, config, &sim))
        .collect();
    let orchestrator = Rc::new(
        Orchestrator::new(kernel.clone(), tiers, &sim, SimLog::disabled("orchestrator")).unwrap(),
    );
    (kernel, orchestrator)
}

fn migrate(
    kernel: &Kernel,
    orchestrator: &Rc<Orchestrator>,
    chunk: Chunk,
    src: usize,
    dst: usize,
) -> bool {
    let result = Rc::new(Cell::new(None));
    let captured = result.clone();
    let orch = orchestrator.clone();
    kernel.spawn(async move {
        captured.set(Some(orch.execute_migration(chunk, src, dst, "test").await));
    });
    kernel.run(None);
    result.get().expect("migration task ran")
}

fn submit_io(kernel: &Kernel, orchestrator: &Rc<Orchestrator>, lba: u64, op: Op) {
    let request = Request {
        id: 0,
        arrival: kernel.now(),
        lba,
        size_bytes: CHUNK_SIZE,
        op,
        completion: None,
        latency: None,
    };
    let orch = orchestrator.clone();
    kernel.spawn(async move { orch.handle_io(request).await });
    kernel.run(None);
}

struct Harness {
    kernel: Kernel,
    orchestrator: Rc<Orchestrator>,
    stream: Rc<RequestStream>,
    controller: Rc<MigrationController>,
}

/// Full assembly: replay, orchestrator and controller all running.
fn harness(
    tier_configs: Vec<TierConfig>,
    sim: SimulationConfig,
    policy: PolicyConfig,
    records: Vec<TraceRecord>,
) -> Harness {
    let kernel = Kernel::new();
    let bottom = tier_configs.len() - 1;
    let tiers: Vec<Tier> = tier_configs
        .iter()
        .enumerate()
        .map(|(index, config)| Tier::new(&kernel, index, index == bottom, config, &sim))
        .collect();
    let orchestrator = Rc::new(
        Orchestrator::new(kernel.clone(), tiers, &sim, SimLog::disabled("orchestrator")).unwrap(),
    );
    let access_log = Rc::new(AccessLog::default());
    let stream = Rc::new(RequestStream::new(
        kernel.clone(),
        &sim,
        access_log.clone(),
        SimLog::disabled("request_stream"),
        ProgressBar::hidden(),
    ));
    orchestrator.set_request_stream(&stream);
    let policy = policy.build(sim.total_chunks, SimLog::disabled("policy"));
    let (tx, _rx) = crossbeam::channel::unbounded();
    let controller = Rc::new(MigrationController::new(
        kernel.clone(),
        orchestrator.clone(),
        stream.clone(),
        access_log,
        policy,
        &sim,
        SimLog::disabled("migration_controller"),
        tx,
    ));
    {
        let stream = stream.clone();
        let orchestrator = orchestrator.clone();
        kernel.spawn(async move {
            stream.replay(orchestrator, Box::new(records.into_iter())).await
        });
    }
    {
        let controller = controller.clone();
        kernel.spawn(async move { controller.run().await });
    }
    Harness {
        kernel,
        orchestrator,
        stream,
        controller,
    }
}

fn assert_single_residency(orchestrator: &Orchestrator, total_chunks: u64) {
    for c in 0..total_chunks {
        let chunk = Chunk(c);
        let holders: Vec<usize> = orchestrator
            .tiers()
            .iter()
            .filter(|tier| tier.has(chunk))
            .map(|tier| tier.index())
            .collect();
        assert_eq!(holders.len(), 1, "chunk {c} resident in tiers {holders:?}");
        assert_eq!(orchestrator.tier_of(chunk), Some(holders[0]));
    }
    for tier in orchestrator.tiers() {
        assert_eq!(tier.used_bytes(), tier.chunk_count() * CHUNK_SIZE);
        if !tier.is_bottom() {
            assert!(tier.used_bytes() <= tier.capacity_bytes());
        }
    }
}

#[test]
fn cold_read_is_served_by_the_backing_tier() {
    let h = harness(
        reference_tiers(),
        sim_config(16),
        PolicyConfig::Lfu,
        vec![read(0.0, 0)],
    );
    // Stop before the first decision window.
    h.kernel.run(Some(Duration::from_millis(50)));

    assert_eq!(h.orchestrator.tier_of(Chunk(0)), Some(2));
    let backing_dev = &h.orchestrator.tiers()[2].devices()[0];
    assert!((ms(backing_dev.busy_time()) - 10.08).abs() < 1e-6);
    assert_eq!(backing_dev.served(), 1);

    assert_eq!(h.stream.generated(), 1);
    assert_eq!(h.stream.completed(), 1);
    let latencies = h.stream.latencies();
    assert!((ms(latencies[0]) - 10.08).abs() < 1e-6);
    assert_eq!(h.controller.executed() + h.controller.failed(), 0);
    assert_single_residency(&h.orchestrator, 16);
}

#[test]
fn second_window_promotes_the_hot_chunk() {
    let h = harness(
        reference_tiers(),
        sim_config(16),
        PolicyConfig::Lfu,
        vec![read(1.0, 0), read(2.0, 0)],
    );
    h.kernel.run(Some(Duration::from_millis(150)));

    assert_eq!(h.orchestrator.tier_of(Chunk(0)), Some(0));
    let tiers = h.orchestrator.tiers();
    assert!(tiers[0].has(Chunk(0)));
    assert!(!tiers[0].get_meta(Chunk(0)).unwrap().dirty);
    // Detached from the backing tier when the promotion landed.
    assert!(!tiers[2].has(Chunk(0)));
    assert_eq!(h.controller.executed(), 1);
    assert_single_residency(&h.orchestrator, 16);

    // A follow-up read is now served by tier 0.
    let before = tiers[0].devices()[0].served();
    let orch = h.orchestrator.clone();
    let request = Request {
        id: 99,
        arrival: h.kernel.now(),
        lba: 0,
        size_bytes: CHUNK_SIZE,
        op: Op::Read,
        completion: None,
        latency: None,
    };
    h.kernel.spawn(async move { orch.handle_io(request).await });
    h.kernel.run(Some(Duration::from_millis(199)));
    assert_eq!(h.orchestrator.tiers()[0].devices()[0].served(), before + 1);
}

#[test]
fn pressure_evicts_the_coldest_tier0_chunk() {
    let mut tier_configs = reference_tiers();
    tier_configs[0].capacity = CHUNK_SIZE; // one chunk
    let mut records = Vec::new();
    for i in 0..5 {
        records.push(read(i as f64, 0));
    }
    for i in 0..10 {
        records.push(read(110.0 + i as f64, LBAS_PER_CHUNK));
    }
    let h = harness(tier_configs, sim_config(4), PolicyConfig::Lfu, records);
    h.kernel.run(Some(Duration::from_millis(250)));

    // First window promoted chunk 0; the second traded it for chunk 1.
    assert_eq!(h.orchestrator.tier_of(Chunk(0)), Some(1));
    assert_eq!(h.orchestrator.tier_of(Chunk(1)), Some(0));
    assert!(h.orchestrator.tiers()[1].has(Chunk(0)));
    assert!(h.orchestrator.tiers()[0].has(Chunk(1)));
    assert_eq!(h.controller.executed(), 3);
    assert_eq!(h.controller.failed(), 0);
    assert_single_residency(&h.orchestrator, 4);
}

#[test]
fn lfu_declines_when_the_cold_resident_is_hotter() {
    let mut tier_configs = reference_tiers();
    tier_configs[0].capacity = CHUNK_SIZE;
    let (kernel, orchestrator) = storage_fixture(tier_configs, 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));

    let mut policy = LfuPolicy::new(4, SimLog::disabled("policy"));
    let window: Vec<AccessRecord> = (0..10).map(|_| access(Chunk(0), Op::Read)).collect();
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());
    assert!(commands.is_empty(), "resident chunk must not be re-promoted");

    let window: Vec<AccessRecord> = (0..2).map(|_| access(Chunk(1), Op::Read)).collect();
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());
    assert!(commands.is_empty(), "freq 2 must not displace freq 10");
}

#[test]
fn lfu_emits_paired_eviction_before_promotion() {
    let mut tier_configs = reference_tiers();
    tier_configs[0].capacity = CHUNK_SIZE;
    let (kernel, orchestrator) = storage_fixture(tier_configs, 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));

    let mut policy = LfuPolicy::new(4, SimLog::disabled("policy"));
    let mut window: Vec<AccessRecord> = (0..2).map(|_| access(Chunk(0), Op::Read)).collect();
    window.extend((0..3).map(|_| access(Chunk(1), Op::Read)));
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].action, MigrationAction::Evict);
    assert_eq!(commands[0].chunk, Chunk(0));
    assert_eq!((commands[0].src, commands[0].dst), (0, 1));
    assert_eq!(commands[1].action, MigrationAction::Promote);
    assert_eq!(commands[1].chunk, Chunk(1));
    assert_eq!((commands[1].src, commands[1].dst), (2, 0));
}

#[test]
fn lfu_discards_out_of_range_accesses() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    let mut policy = LfuPolicy::new(4, SimLog::disabled("policy"));
    let window = vec![access(Chunk(99), Op::Read)];
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());
    assert!(commands.is_empty());
}

#[test]
fn write_then_evict_preserves_dirty_to_non_bottom() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));
    submit_io(&kernel, &orchestrator, 0, Op::Write);
    assert!(orchestrator.tiers()[0].get_meta(Chunk(0)).unwrap().dirty);

    let busy_before = orchestrator.tiers()[1].devices()[0].busy_time();
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 0, 1));
    let meta = orchestrator.tiers()[1].get_meta(Chunk(0)).unwrap();
    assert!(meta.dirty, "dirty state survives a move between bounded tiers");
    assert!(orchestrator.tiers()[1].devices()[0].busy_time() > busy_before);
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn dirty_flush_to_bottom_leaves_the_copy_clean() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));
    submit_io(&kernel, &orchestrator, 0, Op::Write);

    let busy_before = orchestrator.tiers()[2].devices()[0].busy_time();
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 0, 2));
    // Unflushed data forces a physical write on the backing tier.
    assert!(orchestrator.tiers()[2].devices()[0].busy_time() > busy_before);
    let meta = orchestrator.tiers()[2].get_meta(Chunk(0)).unwrap();
    assert!(!meta.dirty);
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(2));
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn clean_evict_round_trip_costs_no_bottom_device_time() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));

    assert!(migrate(&kernel, &orchestrator, Chunk(0), 0, 2));
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(2));
    assert!(!orchestrator.tiers()[2].get_meta(Chunk(0)).unwrap().dirty);
    // The clean copy was still valid below: no physical write happened.
    assert_eq!(
        orchestrator.tiers()[2].devices()[0].busy_time(),
        Duration::ZERO
    );

    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(0));
    assert!(!orchestrator.tiers()[0].get_meta(Chunk(0)).unwrap().dirty);
    assert_eq!(
        orchestrator.tiers()[2].devices()[0].busy_time(),
        Duration::ZERO
    );
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn failed_destination_write_rolls_back_to_source() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));

    orchestrator.tiers()[1].set_write_faults(true);
    assert!(!migrate(&kernel, &orchestrator, Chunk(0), 0, 1));
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(0));
    assert!(orchestrator.tiers()[0].has(Chunk(0)));
    assert!(!orchestrator.tiers()[1].has(Chunk(0)));
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn capacity_denied_migration_leaves_state_untouched() {
    let mut tier_configs = reference_tiers();
    tier_configs[0].capacity = CHUNK_SIZE;
    let (kernel, orchestrator) = storage_fixture(tier_configs, 4);
    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));

    assert!(!migrate(&kernel, &orchestrator, Chunk(1), 2, 0));
    assert_eq!(orchestrator.tier_of(Chunk(1)), Some(2));
    assert!(orchestrator.tiers()[2].has(Chunk(1)));
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn migration_rejects_mismatched_preconditions() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    // Placement disagrees with the claimed source tier.
    assert!(!migrate(&kernel, &orchestrator, Chunk(0), 0, 1));
    // Tier index out of range.
    assert!(!migrate(&kernel, &orchestrator, Chunk(0), 2, 9));
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(2));
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn io_to_an_unplaced_chunk_completes_without_device_work() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    let access_log = Rc::new(AccessLog::default());
    let stream = Rc::new(RequestStream::new(
        kernel.clone(),
        &sim_config(4),
        access_log,
        SimLog::disabled("request_stream"),
        ProgressBar::hidden(),
    ));
    orchestrator.set_request_stream(&stream);

    // Break residency behind the placement map's back.
    orchestrator.tiers()[2].remove_chunk(Chunk(1)).unwrap();
    submit_io(&kernel, &orchestrator, LBAS_PER_CHUNK, Op::Read);

    assert_eq!(stream.completed(), 1);
    assert_eq!(stream.latencies()[0], Duration::ZERO);
    for tier in orchestrator.tiers() {
        for dev in tier.devices() {
            assert_eq!(dev.served(), 0);
        }
    }
}

#[test]
fn concurrent_io_and_migration_on_one_chunk_serialize() {
    let (kernel, orchestrator) = storage_fixture(reference_tiers(), 4);
    {
        let orch = orchestrator.clone();
        let request = Request {
            id: 1,
            arrival: kernel.now(),
            lba: 0,
            size_bytes: CHUNK_SIZE,
            op: Op::Read,
            completion: None,
            latency: None,
        };
        kernel.spawn(async move { orch.handle_io(request).await });
    }
    let result = Rc::new(Cell::new(None));
    {
        let captured = result.clone();
        let orch = orchestrator.clone();
        kernel.spawn(async move {
            captured.set(Some(orch.execute_migration(Chunk(0), 2, 0, "test").await));
        });
    }
    kernel.run(None);

    // The read won the chunk lock and was served below; the migration then
    // went through cleanly.
    assert_eq!(result.get(), Some(true));
    assert_eq!(orchestrator.tier_of(Chunk(0)), Some(0));
    assert_eq!(orchestrator.tiers()[2].devices()[0].served(), 1);
    assert_eq!(orchestrator.tiers()[0].devices()[0].served(), 1);
    assert_single_residency(&orchestrator, 4);
}

#[test]
fn tiered_policy_fills_two_tiers_with_pending_tracking() {
    let mut tier_configs = reference_tiers();
    tier_configs[0].capacity = CHUNK_SIZE;
    tier_configs[1].capacity = CHUNK_SIZE;
    let (kernel, orchestrator) = storage_fixture(tier_configs, 4);
    let mut policy = TieredLfuPolicy::new(4, SimLog::disabled("policy"));

    let mut window: Vec<AccessRecord> = (0..5).map(|_| access(Chunk(0), Op::Read)).collect();
    window.extend((0..3).map(|_| access(Chunk(1), Op::Read)));
    window.push(access(Chunk(2), Op::Read));
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());

    // The hottest chunk takes the fast tier; the runner-up cannot (the one
    // slot is already promised) and lands in the middle tier instead.
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].action, MigrationAction::Promote);
    assert_eq!((commands[0].chunk, commands[0].dst), (Chunk(0), 0));
    assert_eq!(commands[1].action, MigrationAction::Promote);
    assert_eq!((commands[1].chunk, commands[1].dst), (Chunk(1), 1));

    assert!(migrate(&kernel, &orchestrator, Chunk(0), 2, 0));
    assert!(migrate(&kernel, &orchestrator, Chunk(1), 2, 1));

    // A newly hot chunk displaces the fast tier's resident, which falls to
    // the middle tier.
    let window: Vec<AccessRecord> = (0..11).map(|_| access(Chunk(2), Op::Read)).collect();
    let commands = policy.decide(kernel.now(), &window, &orchestrator.view());
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].action, MigrationAction::Evict);
    assert_eq!((commands[0].chunk, commands[0].src, commands[0].dst), (Chunk(0), 0, 1));
    assert_eq!(commands[1].action, MigrationAction::Promote);
    assert_eq!((commands[1].chunk, commands[1].dst), (Chunk(2), 0));
}

#[test]
fn controller_stops_after_simulation_time() {
    let h = harness(
        reference_tiers(),
        sim_config(4),
        PolicyConfig::Noop,
        Vec::new(),
    );
    h.kernel.run(None);
    // Windows fire every 100 ms; the first one past the nominal end with all
    // requests drained shuts the controller down.
    assert_eq!(h.kernel.now(), Duration::from_millis(1100));
    assert_eq!(h.controller.executed(), 0);
    assert_eq!(h.stream.generated(), 0);
}

#[test]
fn access_log_consumption_truncates() {
    let log = AccessLog::default();
    log.append(access(Chunk(0), Op::Read));
    log.append(access(Chunk(1), Op::Write));
    assert_eq!(log.take_window().len(), 2);
    assert!(log.take_window().is_empty());
    log.append(access(Chunk(2), Op::Read));
    assert_eq!(log.take_window().len(), 1);
    assert_eq!(log.total_appended(), 3);
}

#[test]
fn trace_replay_paces_requests_by_inter_arrival_gaps() {
    let records = vec![read(0.0, 0), read(5.0, 0), write(4.0, 0)];
    let h = harness(
        reference_tiers(),
        sim_config(4),
        PolicyConfig::Noop,
        records,
    );
    h.kernel.run(Some(Duration::from_millis(90)));
    assert_eq!(h.stream.generated(), 3);
    assert_eq!(h.stream.completed(), 3);
    // Writes mark the resident copy dirty.
    assert!(h.orchestrator.tiers()[2].get_meta(Chunk(0)).unwrap().dirty);
    // Second and third requests arrive 5 ms apart, backwards jumps clamp to
    // zero wait.
    let backing_dev = &h.orchestrator.tiers()[2].devices()[0];
    assert_eq!(backing_dev.served(), 3);
}
