//! Adapter lifecycle scenarios against the scriptable mock vendor:
//! bring-up ordering, capture cycles, and the recovery path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use neuromon_device::{DeviceAdapter, DeviceConfig, MockVendor};
use neuromon_foundation::{Clock, DeviceError, SharedClock, TestClock};

fn new_adapter(index: u16) -> (DeviceAdapter, Arc<neuromon_device::MockState>, Arc<TestClock>) {
    let (vendor, state) = MockVendor::new();
    let clock = Arc::new(TestClock::new());
    let shared: SharedClock = clock.clone();
    (
        DeviceAdapter::new(Box::new(vendor), index, shared),
        state,
        clock,
    )
}

#[test]
fn bring_up_applies_whole_configuration() {
    let (mut adapter, state, _clock) = new_adapter(3);
    let config = DeviceConfig::defaults_for(3);

    adapter.open().unwrap();
    adapter.initialize().unwrap();
    adapter.apply_configuration(&config).unwrap();

    assert_eq!(state.rate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.depth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.trigger_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.last_rate_code.load(Ordering::SeqCst), 8);
    assert_eq!(state.last_depth.load(Ordering::SeqCst), 100_000);

    // Identity follows the device index.
    let identity = adapter.identity().unwrap();
    assert_eq!(identity.serial, "HT1003");
    assert_eq!(identity.model, "DSO6022BE");
    assert_eq!(identity.firmware, "v2.1.13");
}

#[test]
fn capture_cycle_round_trips_sample_pattern() {
    let (mut adapter, state, _clock) = new_adapter(0);
    *state.sample_words.lock() = vec![0x0000_0005, 0x0000_0002];

    adapter.open().unwrap();
    adapter.initialize().unwrap();
    adapter
        .apply_configuration(&DeviceConfig {
            sample_depth: 6,
            ..DeviceConfig::defaults_for(0)
        })
        .unwrap();

    adapter.start_capture().unwrap();
    adapter.wait_for_capture(Duration::from_secs(2)).unwrap();

    let mut buf = Vec::new();
    adapter.read_samples(&mut buf).unwrap();
    assert_eq!(buf, vec![0x5, 0x2, 0x5, 0x2, 0x5, 0x2]);
}

#[test]
fn delayed_status_still_completes_within_timeout() {
    let (mut adapter, state, clock) = new_adapter(0);
    // 50 "busy" polls at 10 ms each completes well inside 2 s.
    state.status_delay_polls.store(50, Ordering::SeqCst);

    adapter.open().unwrap();
    let before = clock.now();
    adapter.wait_for_capture(Duration::from_secs(2)).unwrap();
    let waited = clock.now().duration_since(before);
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn recovery_survives_a_flaky_reconnect() {
    let (mut adapter, state, _clock) = new_adapter(0);
    adapter.open().unwrap();
    adapter.initialize().unwrap();
    adapter
        .apply_configuration(&DeviceConfig::defaults_for(0))
        .unwrap();

    // First reconnect attempt refuses, the in-budget retry succeeds.
    state.connect_failures.store(1, Ordering::SeqCst);
    adapter.reset_and_reconnect().unwrap();

    // The adapter stays usable afterwards.
    adapter.start_capture().unwrap();
}

#[test]
fn terminal_adapter_refuses_every_operation() {
    let (mut adapter, state, _clock) = new_adapter(0);
    adapter.open().unwrap();
    adapter.initialize().unwrap();
    adapter.set_sample_rate(8).unwrap();
    adapter.set_sample_depth(1_000).unwrap();

    state.connect_failures.store(2, Ordering::SeqCst);
    assert!(adapter.reset_and_reconnect().is_err());

    assert_eq!(adapter.open().unwrap_err(), DeviceError::Terminal);
    assert_eq!(adapter.initialize().unwrap_err(), DeviceError::Terminal);
    assert_eq!(
        adapter.wait_for_capture(Duration::from_secs(2)).unwrap_err(),
        DeviceError::Terminal
    );
    let mut buf = Vec::new();
    assert_eq!(
        adapter.read_samples(&mut buf).unwrap_err(),
        DeviceError::Terminal
    );
}

#[test]
fn configure_refusal_is_typed_not_fatal() {
    let (mut adapter, state, _clock) = new_adapter(0);
    adapter.open().unwrap();
    adapter.initialize().unwrap();

    state.configure_failures.store(1, Ordering::SeqCst);
    let err = adapter.set_sample_rate(4).unwrap_err();
    assert!(matches!(err, DeviceError::ConfigureFail { .. }));
    assert!(!err.is_terminal());

    // The next attempt goes through.
    adapter.set_sample_rate(4).unwrap();
}
