//! Typed, panic-free handle over one device index.
//!
//! The adapter owns its [`VendorApi`] instance and is the only value a
//! worker thread touches; the vendor library is non-reentrant per device
//! index, so the supervisor never hands the same adapter to two threads.
//! A failed recovery poisons the adapter: every later call returns
//! `Terminal`.

use std::time::Duration;

use neuromon_foundation::{DeviceError, SharedClock};

use crate::config::DeviceConfig;
use crate::vendor::{TriggerParams, VendorApi};

/// Identification strings synthesized at connect time; the native API
/// does not report any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: String,
    pub firmware: String,
}

impl DeviceIdentity {
    const MODELS: [&'static str; 4] = ["DSO2090", "DSO2150", "DSO2250", "DSO6022BE"];

    fn for_index(index: u16) -> Self {
        Self {
            serial: format!("HT{}", 1000 + index),
            model: Self::MODELS[index as usize % Self::MODELS.len()].to_string(),
            firmware: format!("v2.1.{}", 10 + index),
        }
    }
}

/// Pre-trigger position used for every capture.
const PRE_TRIGGER_PERCENT: u16 = 50;
/// Gap between the two connect attempts.
const CONNECT_RETRY_GAP: Duration = Duration::from_millis(200);
/// Total budget for open().
const CONNECT_BUDGET: Duration = Duration::from_secs(1);
/// Settle time before reopening a wedged device.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Status poll cadence while a capture is in flight.
const STATUS_POLL: Duration = Duration::from_millis(10);

pub struct DeviceAdapter {
    api: Box<dyn VendorApi>,
    index: u16,
    clock: SharedClock,
    opened: bool,
    terminal: bool,
    sample_rate_code: Option<u16>,
    sample_depth: Option<u32>,
    trigger: Option<(bool, u16, bool)>,
    identity: Option<DeviceIdentity>,
}

impl DeviceAdapter {
    pub fn new(api: Box<dyn VendorApi>, index: u16, clock: SharedClock) -> Self {
        Self {
            api,
            index,
            clock,
            opened: false,
            terminal: false,
            sample_rate_code: None,
            sample_depth: None,
            trigger: None,
            identity: None,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn sample_depth(&self) -> Option<u32> {
        self.sample_depth
    }

    fn ensure_usable(&self) -> Result<(), DeviceError> {
        if self.terminal {
            return Err(DeviceError::Terminal);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        self.ensure_usable()?;
        if !self.opened {
            return Err(DeviceError::NotOpen);
        }
        Ok(())
    }

    /// Connect to the device: two native attempts with a 200 ms gap
    /// inside a 1 s budget.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        self.ensure_usable()?;

        let start = self.clock.now();
        if self.api.connect(self.index)? {
            self.note_connected();
            return Ok(());
        }

        if self.clock.now().duration_since(start) < CONNECT_BUDGET {
            self.clock.sleep(CONNECT_RETRY_GAP);
            if self.api.connect(self.index)? {
                self.note_connected();
                return Ok(());
            }
        }

        Err(DeviceError::ConnectFail { index: self.index })
    }

    fn note_connected(&mut self) {
        self.opened = true;
        self.identity = Some(DeviceIdentity::for_index(self.index));
    }

    pub fn initialize(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.api.init(self.index)? {
            Ok(())
        } else {
            Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "init",
                status: -1,
            })
        }
    }

    pub fn set_sample_rate(&mut self, code: u16) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let status = self.api.set_sample_rate(self.index, code)?;
        if status < 0 {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "sample rate",
                status,
            });
        }
        self.sample_rate_code = Some(code);
        Ok(())
    }

    pub fn set_sample_depth(&mut self, depth: u32) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let status = self.api.set_sample_depth(self.index, depth)?;
        if status < 0 {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "sample depth",
                status,
            });
        }
        self.sample_depth = Some(depth);
        Ok(())
    }

    /// Best-effort: the entry point is optional and its absence is not an
    /// error.
    pub fn set_voltage_threshold(&mut self, threshold: f64) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if !self.api.supports_voltage_threshold() {
            return Ok(());
        }
        let status = self.api.set_pwm_voltage(self.index, threshold, threshold)?;
        if status < 0 {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "voltage threshold",
                status,
            });
        }
        Ok(())
    }

    pub fn configure_trigger(
        &mut self,
        enabled: bool,
        channel: u16,
        rising: bool,
    ) -> Result<(), DeviceError> {
        self.ensure_open()?;

        let status = self.api.enable_trigger(self.index, i16::from(enabled))?;
        if status < 0 {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "trigger enable",
                status,
            });
        }

        if enabled {
            let params = TriggerParams::edge(channel, rising);
            let status = self.api.set_trigger_parameter(self.index, &params)?;
            if status < 0 {
                return Err(DeviceError::ConfigureFail {
                    index: self.index,
                    what: "trigger parameters",
                    status,
                });
            }
        }

        self.trigger = Some((enabled, channel, rising));
        Ok(())
    }

    pub fn set_pre_trigger(&mut self, percent: u16) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let status = self.api.set_pre_trigger(self.index, percent)?;
        if status < 0 {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "pre-trigger",
                status,
            });
        }
        Ok(())
    }

    /// Apply the capture-relevant portion of `config` in one pass.
    pub fn apply_configuration(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        self.set_sample_rate(config.sample_rate_code)?;
        self.set_sample_depth(config.sample_depth)?;
        // Voltage threshold failures are logged, not fatal; the capture
        // path works at the hardware default.
        if let Err(e) = self.set_voltage_threshold(config.voltage_threshold) {
            tracing::warn!("Device {}: voltage threshold not applied: {e}", self.index);
        }
        self.configure_trigger(
            config.enable_trigger,
            config.trigger_channel,
            config.trigger_rising_edge,
        )
    }

    /// Arm acquisition. Rate and depth must have been applied first.
    pub fn start_capture(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.sample_rate_code.is_none() || self.sample_depth.is_none() {
            return Err(DeviceError::ConfigureFail {
                index: self.index,
                what: "rate/depth not set before capture",
                status: -1,
            });
        }

        let armed = self.api.start_capture(self.index)?;
        self.set_pre_trigger(PRE_TRIGGER_PERCENT)?;
        if !armed {
            return Err(DeviceError::ReadFail { index: self.index });
        }
        Ok(())
    }

    /// Poll collection status every 10 ms until complete or `timeout`.
    pub fn wait_for_capture(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let start = self.clock.now();
        loop {
            if self.api.read_status(self.index)? >= 1 {
                return Ok(());
            }
            if self.clock.now().duration_since(start) > timeout {
                return Err(DeviceError::CaptureTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            self.clock.sleep(STATUS_POLL);
        }
    }

    /// Read one capture into `buf`, resized to the configured depth.
    pub fn read_samples(&mut self, buf: &mut Vec<u32>) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let depth = self.sample_depth.ok_or(DeviceError::NotOpen)? as usize;
        buf.resize(depth, 0);
        if self.api.read_samples(self.index, buf, PRE_TRIGGER_PERCENT)? {
            Ok(())
        } else {
            Err(DeviceError::ReadFail { index: self.index })
        }
    }

    /// Full recovery: settle, reconnect, re-initialize, re-apply the
    /// remembered rate/depth/trigger. Failure leaves the adapter
    /// terminal.
    pub fn reset_and_reconnect(&mut self) -> Result<(), DeviceError> {
        self.ensure_usable()?;

        let rate = self.sample_rate_code;
        let depth = self.sample_depth;
        let trigger = self.trigger;

        let result = (|| {
            self.opened = false;
            self.clock.sleep(RECONNECT_DELAY);
            self.open()?;
            self.initialize()?;
            if let Some(code) = rate {
                self.set_sample_rate(code)?;
            }
            if let Some(depth) = depth {
                self.set_sample_depth(depth)?;
            }
            let (enabled, channel, rising) = trigger.unwrap_or((false, 0, true));
            self.configure_trigger(enabled, channel, rising)
        })();

        if result.is_err() {
            tracing::error!("Device {}: recovery failed, adapter is terminal", self.index);
            self.terminal = true;
        }
        result
    }
}
