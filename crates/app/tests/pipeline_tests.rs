//! End-to-end pipeline tests over the mock vendor: supervisor bring-up,
//! per-slot publication consistency, and exporter atomicity under
//! concurrent writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use neuromon_app::supervisor::AdapterFactory;
use neuromon_app::{DeviceState, Exporter, SharedAnalyzerState, Supervisor, SupervisorConfig};
use neuromon_device::{MockState, MockVendor, VendorApi};
use neuromon_foundation::{real_clock, ShutdownToken};
use parking_lot::Mutex;

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn supervisor_drives_mock_devices_to_export() {
    let output_dir = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();
    let shutdown = ShutdownToken::new();

    let mock_states: Arc<Mutex<Vec<Arc<MockState>>>> = Arc::new(Mutex::new(Vec::new()));
    let factory: AdapterFactory = {
        let mock_states = mock_states.clone();
        Box::new(move |_index| {
            let (vendor, state) = MockVendor::new();
            // Channel 0 toggles every sample.
            *state.sample_words.lock() = vec![0x1, 0x0];
            mock_states.lock().push(state);
            Ok(Box::new(vendor) as Box<dyn VendorApi>)
        })
    };

    let mut supervisor = Supervisor::new(
        SupervisorConfig {
            device_count: 2,
            output_dir: output_dir.path().to_path_buf(),
            config_dir: config_dir.path().to_path_buf(),
            export_period: Duration::from_millis(50),
        },
        factory,
        shutdown.clone(),
        real_clock(),
    );
    let shared = supervisor.shared();

    let runner = thread::spawn(move || supervisor.run());

    assert!(
        wait_until(Duration::from_secs(15), || {
            shared.slot(0).captures >= 2 && shared.slot(1).captures >= 2
        }),
        "workers never produced captures"
    );
    assert_eq!(shared.active_devices(), 2);

    // Default config files were materialized for editing.
    assert!(config_dir.path().join("logic_config_0.txt").exists());
    assert!(config_dir.path().join("logic_config_1.txt").exists());

    assert!(wait_until(Duration::from_secs(5), || {
        output_dir.path().join("logic_data.txt").exists()
    }));
    let logic = std::fs::read_to_string(output_dir.path().join("logic_data.txt")).unwrap();
    assert!(logic.contains("DEVICE,0,HT1000,DSO2090,"));
    assert!(logic.contains("DEVICE,1,HT1001,DSO2150,"));
    assert!(logic.contains("CHANNEL,0,A0,"));

    let sliced = std::fs::read_to_string(output_dir.path().join("time_sliced_data.txt")).unwrap();
    assert!(sliced.lines().any(|l| l.starts_with("1,11,")));

    shutdown.request();
    runner.join().unwrap().unwrap();

    // Two devices were opened through the factory.
    assert_eq!(mock_states.lock().len(), 2);
}

#[test]
fn slot_reads_never_observe_torn_state() {
    let shared = SharedAnalyzerState::new(1);
    let stop = Arc::new(AtomicBool::new(false));

    // Writer maintains the invariant: channel 0 carries exactly three
    // transitions per capture.
    let writer = {
        let shared = shared.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut captures = 0u64;
            while !stop.load(Ordering::Relaxed) {
                captures += 1;
                let mut state = DeviceState::default();
                state.connected = true;
                state.active = true;
                state.captures = captures;
                state.channels[0].transitions = 3;
                state.channels[0].total_transitions = captures * 3;
                shared.publish(0, Arc::new(state));
            }
        })
    };

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(500) {
        let state = shared.slot(0);
        if state.captures > 0 {
            assert_eq!(
                state.channels[0].total_transitions,
                state.captures * 3,
                "torn read: captures and totals disagree"
            );
        }
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn exported_files_are_always_complete() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedAnalyzerState::new(1);
    let shutdown = ShutdownToken::new();

    // Writer updates the slot continuously while the exporter runs.
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let shared = shared.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut captures = 0u64;
            while !stop.load(Ordering::Relaxed) {
                captures += 1;
                let mut state = DeviceState::default();
                state.connected = true;
                state.active = true;
                state.serial = "HT1000".into();
                state.model = "DSO2090".into();
                state.captures = captures;
                state.channels[5].transitions = 2;
                state.channels[5].total_transitions = captures * 2;
                state.channels[5].last_change = Some(Instant::now());
                state.recently_changed.insert(5, Instant::now());
                shared.publish(0, Arc::new(state));
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let exporter = Exporter::new(
        shared,
        dir.path().to_path_buf(),
        shutdown.clone(),
        real_clock(),
    )
    .with_period(Duration::from_millis(5));
    let exporter_handle = exporter.spawn();

    let logic_path = dir.path().join("logic_data.txt");
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut successful_reads = 0;
    while Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(&logic_path) {
            successful_reads += 1;
            assert!(
                contents.starts_with("# Neural Monitor Data"),
                "truncated header: {contents:?}"
            );
            assert!(contents.ends_with('\n'), "file missing final newline");
            for line in contents.lines().filter(|l| !l.is_empty()) {
                assert!(
                    line.starts_with('#')
                        || line.starts_with("DEVICE,")
                        || line.starts_with("CHANNEL,")
                        || line.starts_with("PHASE_DATA,"),
                    "unparseable line: {line:?}"
                );
            }
            // Every DEVICE line references the only slot.
            for line in contents.lines().filter(|l| l.starts_with("DEVICE,")) {
                assert_eq!(line.split(',').nth(1), Some("0"));
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(successful_reads > 100, "reader barely ran");

    shutdown.request();
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    exporter_handle.join().unwrap();
}
