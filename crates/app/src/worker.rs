//! Per-device capture worker.
//!
//! One thread per device, owning its adapter and its slot of the shared
//! state. Each iteration polls for configuration changes, runs one
//! arm/wait/read cycle, analyzes all 32 channels, and publishes a
//! complete state value into the slot. Errors feed a recovery ladder:
//! five consecutive failures trigger a device reset, ten end the worker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::Sender;
use neuromon_device::config::modified_time;
use neuromon_device::{DeviceAdapter, DeviceConfig};
use neuromon_dsp::{
    analyze_slices, count_transitions, BandAnalyzer, PhaseAnalyzer, PhaseStats, SampleView,
    SliceParams, BAND_COUNT,
};
use neuromon_foundation::{DeviceError, SharedClock, ShutdownToken};
use parking_lot::Mutex;

use crate::state::{
    DeviceState, SharedAnalyzerState, CHANGE_HIGHLIGHT_MS, CHANNELS, DEFAULT_SLICES,
    PROBE_CHANNELS, TIME_WINDOW_SECS,
};

/// Consecutive failures before the worker resets the device.
const RESET_THRESHOLD: u32 = 5;
/// Consecutive failures before the worker gives up.
const TERMINATE_THRESHOLD: u32 = 10;
/// Budget for the status-poll phase of one capture.
const CAPTURE_WAIT: Duration = Duration::from_secs(2);
/// Hard budget over arm + wait + read.
const CYCLE_BUDGET: Duration = Duration::from_secs(3);
/// Pause after a failed cycle before retrying.
const ERROR_BACKOFF: Duration = Duration::from_millis(200);
/// Settle time after reprogramming the device.
const CONFIG_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker hit the terminal error threshold and exited.
    Terminated { index: usize },
    /// The worker exited cleanly on shutdown.
    Stopped { index: usize },
}

/// Shared rate limit for config-file mtime checks: the window opens every
/// 3 s and slot 0 advances the timer, so each device stats its own file
/// about once per interval.
pub struct ConfigPollGate {
    last_check: Mutex<Instant>,
    interval: Duration,
}

impl ConfigPollGate {
    pub fn new(clock: &SharedClock) -> Self {
        Self {
            last_check: Mutex::new(clock.now()),
            interval: Duration::from_secs(3),
        }
    }

    pub fn window_open(&self, clock: &SharedClock, device_index: usize) -> bool {
        let now = clock.now();
        let mut last = self.last_check.lock();
        if now.duration_since(*last) < self.interval {
            return false;
        }
        if device_index == 0 {
            *last = now;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle ran (successfully or not); sleep the scan interval next.
    Ran,
    /// The device was reprogrammed and has already settled; skip straight
    /// to the next cycle.
    Reconfigured,
    /// Terminal failure; the worker is done.
    Terminated,
}

enum ConfigPoll {
    Unchanged,
    Applied,
    RevertFailed,
}

pub struct DeviceWorker {
    index: usize,
    shared: Arc<SharedAnalyzerState>,
    adapter: DeviceAdapter,
    config: DeviceConfig,
    state: DeviceState,
    shutdown: ShutdownToken,
    clock: SharedClock,
    config_gate: Arc<ConfigPollGate>,
    config_mtime: Option<SystemTime>,
    phase: PhaseAnalyzer,
    bands: BandAnalyzer,
    capture_buf: Vec<u32>,
    events: Option<Sender<WorkerEvent>>,
}

impl DeviceWorker {
    pub fn new(
        index: usize,
        shared: Arc<SharedAnalyzerState>,
        adapter: DeviceAdapter,
        config: DeviceConfig,
        shutdown: ShutdownToken,
        clock: SharedClock,
        config_gate: Arc<ConfigPollGate>,
    ) -> Self {
        let mut state = (*shared.slot(index)).clone();
        state.channel_names = config.channel_names.clone();
        let config_mtime = modified_time(&config.config_path);

        Self {
            index,
            shared,
            adapter,
            config,
            state,
            shutdown,
            clock,
            config_gate,
            config_mtime,
            phase: PhaseAnalyzer::new(),
            bands: BandAnalyzer::new(),
            capture_buf: Vec::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let index = self.index;
        thread::Builder::new()
            .name(format!("device-{index}"))
            .spawn(move || self.run())
            .expect("failed to spawn device worker thread")
    }

    fn run(mut self) {
        tracing::info!("Device {}: worker started", self.index);

        while !self.shutdown.is_requested() && self.state.active {
            match self.step() {
                CycleOutcome::Ran => {
                    let interval = Duration::from_millis(u64::from(self.config.scan_interval_ms));
                    if !self.shutdown.sleep(interval) {
                        break;
                    }
                }
                CycleOutcome::Reconfigured => continue,
                CycleOutcome::Terminated => {
                    tracing::error!(
                        "Device {}: worker terminated after repeated failures",
                        self.index
                    );
                    return;
                }
            }
        }

        tracing::info!("Device {}: worker stopped", self.index);
        if let Some(tx) = &self.events {
            let _ = tx.send(WorkerEvent::Stopped { index: self.index });
        }
    }

    /// One iteration of the capture loop. Public so recovery scenarios
    /// can be driven deterministically in tests.
    pub fn step(&mut self) -> CycleOutcome {
        if self.shared.take_reset_request(self.index) {
            tracing::info!("Device {}: statistics reset", self.index);
            self.state.reset_statistics();
            self.publish();
        }

        match self.poll_configuration() {
            ConfigPoll::Unchanged => {}
            ConfigPoll::Applied => {
                self.clock.sleep(CONFIG_SETTLE);
                return CycleOutcome::Reconfigured;
            }
            ConfigPoll::RevertFailed => return self.terminate(),
        }

        match self.capture_once() {
            Ok(()) => {
                self.state.consecutive_errors = 0;
                self.state.captures += 1;
                self.state.last_capture = Some(self.clock.now());
            }
            Err(e) => {
                self.state.consecutive_errors += 1;
                self.state.errors += 1;
                tracing::warn!(
                    "Device {}: capture cycle failed ({} consecutive): {e}",
                    self.index,
                    self.state.consecutive_errors
                );

                if self.state.consecutive_errors >= RESET_THRESHOLD {
                    if self.recover() {
                        self.state.consecutive_errors = 0;
                    } else if self.state.consecutive_errors >= TERMINATE_THRESHOLD {
                        return self.terminate();
                    }
                }
                self.clock.sleep(ERROR_BACKOFF);
            }
        }

        self.expire_recent_changes();
        self.publish();
        CycleOutcome::Ran
    }

    /// Arm, wait, read and analyze one capture under the cycle budget.
    fn capture_once(&mut self) -> Result<(), DeviceError> {
        let cycle_start = self.clock.now();

        self.adapter.start_capture()?;
        self.adapter.wait_for_capture(CAPTURE_WAIT)?;
        self.check_budget(cycle_start)?;

        self.adapter.read_samples(&mut self.capture_buf)?;
        self.check_budget(cycle_start)?;

        self.analyze();
        Ok(())
    }

    fn check_budget(&self, cycle_start: Instant) -> Result<(), DeviceError> {
        if self.clock.now().duration_since(cycle_start) > CYCLE_BUDGET {
            return Err(DeviceError::CaptureTimeout {
                timeout_ms: CYCLE_BUDGET.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn analyze(&mut self) {
        let now = self.clock.now();
        let sample_rate = self.config.sample_rate_hz() as f64;
        let params = SliceParams {
            slice_count: DEFAULT_SLICES,
            sample_rate,
            time_window: TIME_WINDOW_SECS,
        };

        let probe_results = self.analyze_probe_channels(sample_rate);

        let words = &self.capture_buf;
        for ch in 0..CHANNELS {
            let view = SampleView::new(words, ch as u8);
            let summary = count_transitions(&view);
            let slices = analyze_slices(&view, &params);

            let metrics = &mut self.state.channels[ch];
            metrics.current_state = summary.ending_state;
            metrics.transitions = summary.transitions;
            metrics.total_transitions += u64::from(summary.transitions);
            metrics.slice_transitions = slices.transitions;
            metrics.slice_activity = slices.activity;

            if summary.transitions > 0 {
                metrics.last_change = Some(now);
                self.state.recently_changed.insert(ch, now);
            }

            if ch < PROBE_CHANNELS {
                let (stats, bands) = &probe_results[ch];
                metrics.mean_phase = stats.mean_phase;
                metrics.phase_variance = stats.variance;
                if let Some(bands) = bands {
                    metrics.band_magnitudes = *bands;
                }
            }
        }
    }

    /// Phase and band statistics for channels 0..12, fanned out over
    /// scoped threads sized to hardware parallelism. Joined before the
    /// cycle publishes, so results are indistinguishable from the serial
    /// computation.
    fn analyze_probe_channels(
        &self,
        sample_rate: f64,
    ) -> Vec<(PhaseStats, Option<[f64; BAND_COUNT]>)> {
        let words: &[u32] = &self.capture_buf;
        let phase = &self.phase;
        let bands = &self.bands;

        let workers = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(PROBE_CHANNELS);
        let chunk = PROBE_CHANNELS.div_ceil(workers);

        let mut results = Vec::with_capacity(PROBE_CHANNELS);
        thread::scope(|s| {
            let handles: Vec<_> = (0..PROBE_CHANNELS)
                .step_by(chunk)
                .map(|start| {
                    let end = (start + chunk).min(PROBE_CHANNELS);
                    s.spawn(move || {
                        (start..end)
                            .map(|ch| {
                                let view = SampleView::new(words, ch as u8);
                                (phase.analyze(&view), bands.analyze(&view, sample_rate))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            for handle in handles {
                results.extend(handle.join().expect("phase analysis thread panicked"));
            }
        });
        results
    }

    fn poll_configuration(&mut self) -> ConfigPoll {
        if !self.config_gate.window_open(&self.clock, self.index) {
            return ConfigPoll::Unchanged;
        }

        let Some(mtime) = modified_time(&self.config.config_path) else {
            return ConfigPoll::Unchanged;
        };
        if self.config_mtime.is_some_and(|prev| mtime <= prev) {
            return ConfigPoll::Unchanged;
        }
        self.config_mtime = Some(mtime);

        let previous = self.config.clone();
        if let Err(e) = self.config.load_from_disk() {
            tracing::warn!("Device {}: config reload failed: {e}", self.index);
            return ConfigPoll::Unchanged;
        }

        // Host-side settings take effect without touching the hardware.
        self.state.channel_names = self.config.channel_names.clone();

        if !self.config.needs_device_reapply(&previous) {
            return ConfigPoll::Unchanged;
        }

        tracing::info!("Device {}: applying updated configuration", self.index);
        match self.adapter.apply_configuration(&self.config) {
            Ok(()) => ConfigPoll::Applied,
            Err(e) => {
                tracing::warn!(
                    "Device {}: new configuration rejected ({e}); reverting",
                    self.index
                );
                self.config = previous;
                match self.adapter.apply_configuration(&self.config) {
                    Ok(()) => ConfigPoll::Applied,
                    Err(e) => {
                        tracing::error!("Device {}: revert failed: {e}", self.index);
                        ConfigPoll::RevertFailed
                    }
                }
            }
        }
    }

    fn recover(&mut self) -> bool {
        tracing::warn!("Device {}: resetting after repeated errors", self.index);
        match self
            .adapter
            .reset_and_reconnect()
            .and_then(|()| self.adapter.apply_configuration(&self.config))
        {
            Ok(()) => {
                tracing::info!("Device {}: recovery succeeded", self.index);
                true
            }
            Err(e) => {
                tracing::warn!("Device {}: recovery failed: {e}", self.index);
                false
            }
        }
    }

    fn terminate(&mut self) -> CycleOutcome {
        self.state.active = false;
        self.publish();
        self.shared.note_worker_terminated();
        if let Some(tx) = &self.events {
            let _ = tx.send(WorkerEvent::Terminated { index: self.index });
        }
        CycleOutcome::Terminated
    }

    fn expire_recent_changes(&mut self) {
        let now = self.clock.now();
        let ttl = Duration::from_millis(CHANGE_HIGHLIGHT_MS);
        self.state
            .recently_changed
            .retain(|_, changed| now.duration_since(*changed) <= ttl);
    }

    fn publish(&self) {
        self.shared
            .publish(self.index, Arc::new(self.state.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceState;
    use neuromon_device::{DeviceAdapter, MockState, MockVendor};
    use neuromon_foundation::TestClock;
    use std::sync::atomic::Ordering;

    struct Fixture {
        worker: DeviceWorker,
        mock: Arc<MockState>,
        clock: Arc<TestClock>,
        shared: Arc<SharedAnalyzerState>,
    }

    fn fixture_with_config(config: DeviceConfig) -> Fixture {
        let clock: Arc<TestClock> = Arc::new(TestClock::new());
        let shared_clock: SharedClock = clock.clone();

        let (vendor, mock) = MockVendor::new();
        let mut adapter = DeviceAdapter::new(Box::new(vendor), 0, shared_clock.clone());
        adapter.open().unwrap();
        adapter.initialize().unwrap();
        adapter.apply_configuration(&config).unwrap();

        let shared = SharedAnalyzerState::new(1);
        let mut initial = DeviceState::default();
        initial.connected = true;
        initial.active = true;
        shared.publish(0, Arc::new(initial));
        shared.note_device_activated();

        let gate = Arc::new(ConfigPollGate::new(&shared_clock));
        let worker = DeviceWorker::new(
            0,
            shared.clone(),
            adapter,
            config,
            ShutdownToken::new(),
            shared_clock,
            gate,
        );

        Fixture {
            worker,
            mock,
            clock,
            shared,
        }
    }

    fn fixture(dir: &tempfile::TempDir) -> Fixture {
        let mut config = DeviceConfig::defaults_for(0);
        config.sample_depth = 1_000;
        config.config_path = dir.path().join("logic_config_0.txt");
        fixture_with_config(config)
    }

    #[test]
    fn successful_cycle_publishes_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);
        *fx.mock.sample_words.lock() = vec![0x1, 0x0];

        assert_eq!(fx.worker.step(), CycleOutcome::Ran);

        let state = fx.shared.slot(0);
        assert_eq!(state.captures, 1);
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.channels[0].transitions, 999);
        assert!(state.recently_changed.contains_key(&0));
        assert!(state.last_capture.is_some());
        // Channel 1 never moves.
        assert_eq!(state.channels[1].transitions, 0);
    }

    #[test]
    fn five_failures_trigger_exactly_one_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);
        fx.mock.start_capture_failures.store(5, Ordering::SeqCst);

        for expected in 1..=4u32 {
            assert_eq!(fx.worker.step(), CycleOutcome::Ran);
            assert_eq!(fx.shared.slot(0).consecutive_errors, expected);
        }

        let connects_before = fx.mock.connect_calls.load(Ordering::SeqCst);
        assert_eq!(fx.worker.step(), CycleOutcome::Ran);

        // One reset: exactly one extra connect, counter cleared.
        assert_eq!(
            fx.mock.connect_calls.load(Ordering::SeqCst),
            connects_before + 1
        );
        assert_eq!(fx.shared.slot(0).consecutive_errors, 0);

        // Cycle six succeeds.
        assert_eq!(fx.worker.step(), CycleOutcome::Ran);
        let state = fx.shared.slot(0);
        assert_eq!(state.captures, 1);
        assert_eq!(state.errors, 5);
        assert!(state.active);
        assert_eq!(fx.shared.active_devices(), 1);
    }

    #[test]
    fn ten_failures_terminate_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let fx = fixture(&dir);
        let mut worker = fx.worker.with_events(tx);

        fx.mock.start_capture_failures.store(100, Ordering::SeqCst);
        fx.mock.connect_failures.store(100, Ordering::SeqCst);

        let mut outcome = CycleOutcome::Ran;
        let mut steps = 0;
        while outcome != CycleOutcome::Terminated && steps < 20 {
            outcome = worker.step();
            steps += 1;
        }

        assert_eq!(outcome, CycleOutcome::Terminated);
        assert_eq!(steps, 10);
        let state = fx.shared.slot(0);
        assert!(!state.active);
        assert_eq!(fx.shared.active_devices(), 0);
        assert_eq!(rx.try_recv().unwrap(), WorkerEvent::Terminated { index: 0 });
    }

    #[test]
    fn capture_timeout_counts_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);
        // Status stays busy long enough to blow the 2 s wait.
        fx.mock.status_delay_polls.store(100_000, Ordering::SeqCst);

        assert_eq!(fx.worker.step(), CycleOutcome::Ran);
        let state = fx.shared.slot(0);
        assert_eq!(state.consecutive_errors, 1);
        assert_eq!(state.captures, 0);
    }

    #[test]
    fn channel_rename_reloads_without_reapply() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);

        let rate_calls_before = fx.mock.rate_calls.load(Ordering::SeqCst);
        std::fs::write(
            fx.worker.config.config_path.clone(),
            "channel_0=Foo\n",
        )
        .unwrap();
        fx.clock.advance(Duration::from_secs(4));

        assert_eq!(fx.worker.step(), CycleOutcome::Ran);
        assert_eq!(
            fx.mock.rate_calls.load(Ordering::SeqCst),
            rate_calls_before
        );
        assert_eq!(fx.shared.slot(0).channel_names[0], "Foo");
    }

    #[test]
    fn depth_change_reapplies_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);

        let rate_calls_before = fx.mock.rate_calls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(
            fx.worker.config.config_path.clone(),
            "sample_depth=200000\n",
        )
        .unwrap();
        fx.clock.advance(Duration::from_secs(4));

        assert_eq!(fx.worker.step(), CycleOutcome::Reconfigured);
        assert_eq!(
            fx.mock.rate_calls.load(Ordering::SeqCst),
            rate_calls_before + 1
        );
        assert_eq!(fx.mock.last_depth.load(Ordering::SeqCst), 200_000);
    }

    #[test]
    fn recent_changes_expire_after_highlight_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);
        *fx.mock.sample_words.lock() = vec![0x1, 0x0];

        assert_eq!(fx.worker.step(), CycleOutcome::Ran);
        assert!(fx.shared.slot(0).recently_changed.contains_key(&0));

        // Freeze the signal and move past the highlight window.
        *fx.mock.sample_words.lock() = vec![0x0];
        fx.clock.advance(Duration::from_secs(4));
        assert_eq!(fx.worker.step(), CycleOutcome::Ran);
        assert!(!fx.shared.slot(0).recently_changed.contains_key(&0));
    }

    #[test]
    fn statistics_reset_request_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(&dir);
        *fx.mock.sample_words.lock() = vec![0x1, 0x0];

        fx.worker.step();
        assert_eq!(fx.shared.slot(0).captures, 1);

        fx.shared.request_statistics_reset(0);
        fx.worker.step();

        let state = fx.shared.slot(0);
        // The reset lands before the cycle, so only the new capture shows.
        assert_eq!(state.captures, 1);
        assert_eq!(state.errors, 0);
    }
}
