//! Shared analyzer state: one slot per configured device.
//!
//! Each slot holds an immutable `Arc<DeviceState>` behind a read lock.
//! The owning worker builds a complete state value per cycle and swaps it
//! in; readers clone the `Arc` and therefore always observe a coherent
//! publication from some prior cycle, never a half-updated slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use neuromon_dsp::BAND_COUNT;
use parking_lot::RwLock;

pub const CHANNELS: usize = 32;
/// Channels carrying phase and band analysis.
pub const PROBE_CHANNELS: usize = 12;
pub const DEFAULT_SLICES: usize = 5;
/// Activity normalization window in seconds.
pub const TIME_WINDOW_SECS: f64 = 0.0003;
/// How long a channel stays in the recently-changed set.
pub const CHANGE_HIGHLIGHT_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMetrics {
    /// Logic level after the most recent capture.
    pub current_state: u8,
    /// Transitions observed in the most recent capture.
    pub transitions: u32,
    /// Transitions accumulated since startup or the last statistics reset.
    pub total_transitions: u64,
    pub last_change: Option<Instant>,
    pub slice_transitions: Vec<u32>,
    pub slice_activity: Vec<f64>,
    pub mean_phase: f64,
    pub phase_variance: f64,
    pub band_magnitudes: [f64; BAND_COUNT],
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self {
            current_state: 0,
            transitions: 0,
            total_transitions: 0,
            last_change: None,
            slice_transitions: vec![0; DEFAULT_SLICES],
            slice_activity: vec![0.0; DEFAULT_SLICES],
            mean_phase: 0.0,
            phase_variance: 0.0,
            band_magnitudes: [0.0; BAND_COUNT],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub connected: bool,
    pub active: bool,
    pub consecutive_errors: u32,
    pub captures: u64,
    pub errors: u64,
    pub channels: Vec<ChannelMetrics>,
    /// Channels that changed within the highlight window, with the time
    /// of their last change.
    pub recently_changed: BTreeMap<usize, Instant>,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub channel_names: Vec<String>,
    pub last_capture: Option<Instant>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            connected: false,
            active: false,
            consecutive_errors: 0,
            captures: 0,
            errors: 0,
            channels: vec![ChannelMetrics::default(); CHANNELS],
            recently_changed: BTreeMap::new(),
            serial: "Unknown".into(),
            model: "Unknown".into(),
            firmware: "Unknown".into(),
            channel_names: (0..CHANNELS)
                .map(|ch| {
                    if ch < 16 {
                        format!("A{ch}")
                    } else {
                        format!("B{}", ch - 16)
                    }
                })
                .collect(),
            last_capture: None,
        }
    }
}

impl DeviceState {
    /// Zero every statistic while keeping identity and connection state.
    pub fn reset_statistics(&mut self) {
        self.captures = 0;
        self.errors = 0;
        self.consecutive_errors = 0;
        for metrics in &mut self.channels {
            metrics.transitions = 0;
            metrics.total_transitions = 0;
        }
        self.recently_changed.clear();
    }
}

/// Point-in-time view over every slot, taken by the exporter each tick.
#[derive(Clone)]
pub struct Snapshot {
    pub devices: Vec<Arc<DeviceState>>,
}

pub struct SharedAnalyzerState {
    slots: Vec<RwLock<Arc<DeviceState>>>,
    reset_requests: Vec<AtomicBool>,
    active_devices: AtomicUsize,
}

impl SharedAnalyzerState {
    pub fn new(device_count: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..device_count)
                .map(|_| RwLock::new(Arc::new(DeviceState::default())))
                .collect(),
            reset_requests: (0..device_count).map(|_| AtomicBool::new(false)).collect(),
            active_devices: AtomicUsize::new(0),
        })
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    /// Swap a complete publication into the slot. Only the owning worker
    /// (or the supervisor, before workers start) calls this.
    pub fn publish(&self, index: usize, state: Arc<DeviceState>) {
        *self.slots[index].write() = state;
    }

    pub fn slot(&self, index: usize) -> Arc<DeviceState> {
        self.slots[index].read().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            devices: self.slots.iter().map(|slot| slot.read().clone()).collect(),
        }
    }

    pub fn active_devices(&self) -> usize {
        self.active_devices.load(Ordering::Acquire)
    }

    /// Startup accounting only; the counter never re-increments once
    /// workers are running.
    pub fn note_device_activated(&self) {
        self.active_devices.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_worker_terminated(&self) {
        self.active_devices.fetch_sub(1, Ordering::AcqRel);
    }

    /// Ask the owning worker to zero its statistics at the next cycle
    /// boundary; keeps the single-writer discipline intact.
    pub fn request_statistics_reset(&self, index: usize) {
        if let Some(flag) = self.reset_requests.get(index) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn take_reset_request(&self, index: usize) -> bool {
        self.reset_requests[index].swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_read_round_trips() {
        let shared = SharedAnalyzerState::new(2);
        let mut state = DeviceState::default();
        state.connected = true;
        state.captures = 7;
        shared.publish(1, Arc::new(state));

        let read = shared.slot(1);
        assert!(read.connected);
        assert_eq!(read.captures, 7);
        assert!(!shared.slot(0).connected);
    }

    #[test]
    fn snapshot_covers_every_slot() {
        let shared = SharedAnalyzerState::new(3);
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.devices.len(), 3);
    }

    #[test]
    fn active_counter_tracks_terminations() {
        let shared = SharedAnalyzerState::new(2);
        shared.note_device_activated();
        shared.note_device_activated();
        shared.note_worker_terminated();
        assert_eq!(shared.active_devices(), 1);
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let shared = SharedAnalyzerState::new(1);
        assert!(!shared.take_reset_request(0));
        shared.request_statistics_reset(0);
        assert!(shared.take_reset_request(0));
        assert!(!shared.take_reset_request(0));
    }

    #[test]
    fn reset_statistics_keeps_identity() {
        let mut state = DeviceState::default();
        state.connected = true;
        state.serial = "HT1003".into();
        state.captures = 9;
        state.errors = 2;
        state.channels[4].total_transitions = 100;
        state.recently_changed.insert(4, Instant::now());

        state.reset_statistics();

        assert_eq!(state.captures, 0);
        assert_eq!(state.errors, 0);
        assert_eq!(state.channels[4].total_transitions, 0);
        assert!(state.recently_changed.is_empty());
        assert_eq!(state.serial, "HT1003");
        assert!(state.connected);
    }
}
