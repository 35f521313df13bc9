//! The raw vendor-library call surface as a capability trait.
//!
//! `Err` at this level means the boundary itself failed (library unusable,
//! foreign fault); a device-level refusal travels as `Ok(false)` or a
//! negative status, matching the native convention.

use neuromon_foundation::DeviceError;

/// Edge-trigger parameter record passed to `Set_Trig_Parameter`.
///
/// Only `edge_signal` and `edge_slope` are meaningful to this system; the
/// remaining fields exist to match the vendor ABI and stay zeroed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerParams {
    pub edge_signal: u16,
    pub edge_slope: u16,
    pub intr_range: i16,
    pub range_max: u32,
    pub range_min: u32,
    pub range_sh: u32,
    pub range_mo: u16,
    pub intr_time: i16,
    pub time_max: u32,
    pub time_min: u32,
    pub time_mo: u16,
    pub intr_equ: i16,
    pub equ_sh: u32,
    pub equ_dat: u32,
    pub equ_so: u16,
}

impl TriggerParams {
    /// Edge trigger on `channel`, rising or falling.
    pub fn edge(channel: u16, rising: bool) -> Self {
        TriggerParams {
            edge_signal: channel,
            edge_slope: u16::from(rising),
            ..Default::default()
        }
    }
}

/// One native entry point per method; every call takes the device index
/// the way the library does.
pub trait VendorApi: Send {
    fn connect(&self, index: u16) -> Result<bool, DeviceError>;

    fn init(&self, index: u16) -> Result<bool, DeviceError>;

    /// Negative status means the device rejected the rate code.
    fn set_sample_rate(&self, index: u16, code: u16) -> Result<i16, DeviceError>;

    fn set_sample_depth(&self, index: u16, depth: u32) -> Result<i16, DeviceError>;

    /// Threshold voltage, passed twice per the native signature. Only
    /// called when [`VendorApi::supports_voltage_threshold`] is true.
    fn set_pwm_voltage(&self, index: u16, low: f64, high: f64) -> Result<i16, DeviceError>;

    fn enable_trigger(&self, index: u16, enabled: i16) -> Result<i16, DeviceError>;

    fn set_trigger_parameter(&self, index: u16, params: &TriggerParams) -> Result<i16, DeviceError>;

    fn set_pre_trigger(&self, index: u16, percent: u16) -> Result<i16, DeviceError>;

    fn start_capture(&self, index: u16) -> Result<bool, DeviceError>;

    /// Collection status; >= 1 means the capture is complete.
    fn read_status(&self, index: u16) -> Result<u32, DeviceError>;

    /// Fill `buf` with bit-packed samples. `buf.len()` is the configured
    /// depth; bit c of word k is channel c at sample k.
    fn read_samples(&self, index: u16, buf: &mut [u32], pre_trigger: u16)
        -> Result<bool, DeviceError>;

    /// Whether the optional voltage-threshold entry point is present.
    fn supports_voltage_threshold(&self) -> bool;
}
