//! Scriptable in-memory vendor for deterministic tests.
//!
//! Failure budgets are consumed call by call: set
//! `start_capture_failures` to 5 and the first five arms refuse, the
//! sixth succeeds. Call counters let tests assert how often the adapter
//! touched each entry point.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use neuromon_foundation::DeviceError;
use parking_lot::Mutex;

use crate::vendor::{TriggerParams, VendorApi};

#[derive(Default)]
pub struct MockState {
    // Remaining scripted refusals, consumed in call order.
    pub connect_failures: AtomicUsize,
    pub init_failures: AtomicUsize,
    pub configure_failures: AtomicUsize,
    pub start_capture_failures: AtomicUsize,
    pub read_failures: AtomicUsize,
    /// Polls answering "not ready" before the capture completes.
    pub status_delay_polls: AtomicUsize,
    /// When set, the next read simulates a foreign fault.
    pub fault_next_read: AtomicBool,

    /// Pattern cycled into the capture buffer on reads.
    pub sample_words: Mutex<Vec<u32>>,

    pub connect_calls: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub rate_calls: AtomicUsize,
    pub depth_calls: AtomicUsize,
    pub trigger_calls: AtomicUsize,
    pub pre_trigger_calls: AtomicUsize,
    pub capture_calls: AtomicUsize,
    pub read_calls: AtomicUsize,

    pub last_rate_code: AtomicUsize,
    pub last_depth: AtomicUsize,
}

impl MockState {
    /// Consume one scripted failure if any remain.
    fn consume(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct MockVendor {
    state: Arc<MockState>,
}

impl MockVendor {
    pub fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }

    pub fn with_state(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

impl VendorApi for MockVendor {
    fn connect(&self, _index: u16) -> Result<bool, DeviceError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!MockState::consume(&self.state.connect_failures))
    }

    fn init(&self, _index: u16) -> Result<bool, DeviceError> {
        self.state.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!MockState::consume(&self.state.init_failures))
    }

    fn set_sample_rate(&self, _index: u16, code: u16) -> Result<i16, DeviceError> {
        self.state.rate_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .last_rate_code
            .store(code as usize, Ordering::SeqCst);
        if MockState::consume(&self.state.configure_failures) {
            return Ok(-1);
        }
        Ok(0)
    }

    fn set_sample_depth(&self, _index: u16, depth: u32) -> Result<i16, DeviceError> {
        self.state.depth_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .last_depth
            .store(depth as usize, Ordering::SeqCst);
        if MockState::consume(&self.state.configure_failures) {
            return Ok(-1);
        }
        Ok(0)
    }

    fn set_pwm_voltage(&self, _index: u16, _low: f64, _high: f64) -> Result<i16, DeviceError> {
        Ok(0)
    }

    fn enable_trigger(&self, _index: u16, _enabled: i16) -> Result<i16, DeviceError> {
        self.state.trigger_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn set_trigger_parameter(
        &self,
        _index: u16,
        _params: &TriggerParams,
    ) -> Result<i16, DeviceError> {
        Ok(0)
    }

    fn set_pre_trigger(&self, _index: u16, _percent: u16) -> Result<i16, DeviceError> {
        self.state.pre_trigger_calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn start_capture(&self, _index: u16) -> Result<bool, DeviceError> {
        self.state.capture_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!MockState::consume(&self.state.start_capture_failures))
    }

    fn read_status(&self, _index: u16) -> Result<u32, DeviceError> {
        if MockState::consume(&self.state.status_delay_polls) {
            Ok(0)
        } else {
            Ok(1)
        }
    }

    fn read_samples(
        &self,
        _index: u16,
        buf: &mut [u32],
        _pre_trigger: u16,
    ) -> Result<bool, DeviceError> {
        self.state.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fault_next_read.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::NativeFault {
                call: "ReadSrcData",
            });
        }
        if MockState::consume(&self.state.read_failures) {
            return Ok(false);
        }

        let pattern = self.state.sample_words.lock();
        if pattern.is_empty() {
            buf.fill(0);
        } else {
            for (i, word) in buf.iter_mut().enumerate() {
                *word = pattern[i % pattern.len()];
            }
        }
        Ok(true)
    }

    fn supports_voltage_threshold(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let (mock, state) = MockVendor::new();
        state.start_capture_failures.store(2, Ordering::SeqCst);

        assert!(!mock.start_capture(0).unwrap());
        assert!(!mock.start_capture(0).unwrap());
        assert!(mock.start_capture(0).unwrap());
        assert_eq!(state.capture_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sample_pattern_cycles_into_buffer() {
        let (mock, state) = MockVendor::new();
        *state.sample_words.lock() = vec![0x1, 0x0];

        let mut buf = vec![0u32; 5];
        assert!(mock.read_samples(0, &mut buf, 50).unwrap());
        assert_eq!(buf, vec![0x1, 0x0, 0x1, 0x0, 0x1]);
    }

    #[test]
    fn status_delay_counts_down() {
        let (mock, state) = MockVendor::new();
        state.status_delay_polls.store(3, Ordering::SeqCst);
        assert_eq!(mock.read_status(0).unwrap(), 0);
        assert_eq!(mock.read_status(0).unwrap(), 0);
        assert_eq!(mock.read_status(0).unwrap(), 0);
        assert_eq!(mock.read_status(0).unwrap(), 1);
    }

    #[test]
    fn read_fault_fires_once() {
        let (mock, state) = MockVendor::new();
        state.fault_next_read.store(true, Ordering::SeqCst);

        let mut buf = vec![0u32; 4];
        assert!(mock.read_samples(0, &mut buf, 50).is_err());
        assert!(mock.read_samples(0, &mut buf, 50).is_ok());
    }
}
