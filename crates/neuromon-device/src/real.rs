//! Runtime binding of the vendor acquisition DLL.
//!
//! Symbols are resolved once at load; missing mandatory entry points fail
//! the load. Every call is wrapped in a recovery boundary so nothing the
//! foreign side does unwinds into a worker thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use libloading::Library;
use neuromon_foundation::DeviceError;

use crate::vendor::{TriggerParams, VendorApi};

type DevConnectFn = unsafe extern "system" fn(u16) -> bool;
type InitDeviceFn = unsafe extern "system" fn(u16) -> bool;
type SetCmdLaFn = unsafe extern "system" fn(u16) -> bool;
type SetSampleRateFn = unsafe extern "system" fn(u16, u16) -> i16;
type SetSampleDepthFn = unsafe extern "system" fn(u16, u32) -> i16;
type SetTrigEnFn = unsafe extern "system" fn(u16, i16, i16) -> i16;
type SetTrigParameterFn = unsafe extern "system" fn(u16, u16, *const TriggerParams) -> i16;
type ReadCollectStatusFn = unsafe extern "system" fn(u16) -> u32;
type ReadSrcDataFn = unsafe extern "system" fn(u16, *mut u32, u32, u16) -> bool;
type SetPwmvFn = unsafe extern "system" fn(u16, f64, f64) -> i16;
type SetPreTriFn = unsafe extern "system" fn(u16, u16) -> i16;

/// The vendor DLL with its entry points resolved.
///
/// Function pointers are copied out of the loaded library; `_library`
/// keeps the code mapped for as long as this value lives.
#[derive(Debug)]
pub struct RealVendor {
    _library: Library,
    dev_connect: DevConnectFn,
    init_device: InitDeviceFn,
    set_cmd_la: SetCmdLaFn,
    set_sample_rate: SetSampleRateFn,
    set_sample_depth: SetSampleDepthFn,
    set_trig_en: SetTrigEnFn,
    set_trig_parameter: SetTrigParameterFn,
    read_collect_status: ReadCollectStatusFn,
    read_src_data: ReadSrcDataFn,
    set_pre_tri: SetPreTriFn,
    // Optional in older DLL revisions.
    set_pwmv: Option<SetPwmvFn>,
}

impl RealVendor {
    pub fn load(path: &Path) -> Result<Self, DeviceError> {
        let library = unsafe { Library::new(path) }.map_err(|e| {
            DeviceError::LibraryLoad(format!("{}: {e}", path.display()))
        })?;

        unsafe {
            fn missing(name: &str, e: libloading::Error) -> DeviceError {
                DeviceError::LibraryLoad(format!("entry point {name}: {e}"))
            }

            let dev_connect = *library
                .get::<DevConnectFn>(b"DevConnect\0")
                .map_err(|e| missing("DevConnect", e))?;
            let init_device = *library
                .get::<InitDeviceFn>(b"InitDevice\0")
                .map_err(|e| missing("InitDevice", e))?;
            let set_cmd_la = *library
                .get::<SetCmdLaFn>(b"SetCmdLA\0")
                .map_err(|e| missing("SetCmdLA", e))?;
            let set_sample_rate = *library
                .get::<SetSampleRateFn>(b"Set_Sample_Rate\0")
                .map_err(|e| missing("Set_Sample_Rate", e))?;
            let set_sample_depth = *library
                .get::<SetSampleDepthFn>(b"Set_SampleDepth\0")
                .map_err(|e| missing("Set_SampleDepth", e))?;
            let set_trig_en = *library
                .get::<SetTrigEnFn>(b"Set_Trig_En\0")
                .map_err(|e| missing("Set_Trig_En", e))?;
            let set_trig_parameter = *library
                .get::<SetTrigParameterFn>(b"Set_Trig_Parameter\0")
                .map_err(|e| missing("Set_Trig_Parameter", e))?;
            let read_collect_status = *library
                .get::<ReadCollectStatusFn>(b"ReadCollectStatus\0")
                .map_err(|e| missing("ReadCollectStatus", e))?;
            let read_src_data = *library
                .get::<ReadSrcDataFn>(b"ReadSrcData\0")
                .map_err(|e| missing("ReadSrcData", e))?;
            let set_pre_tri = *library
                .get::<SetPreTriFn>(b"Set_Pre_Tri\0")
                .map_err(|e| missing("Set_Pre_Tri", e))?;

            let set_pwmv = library.get::<SetPwmvFn>(b"Set_PWMV\0").ok().map(|s| *s);
            if set_pwmv.is_none() {
                tracing::debug!(
                    "Set_PWMV not exported by {}; voltage threshold disabled",
                    path.display()
                );
            }

            Ok(Self {
                _library: library,
                dev_connect,
                init_device,
                set_cmd_la,
                set_sample_rate,
                set_sample_depth,
                set_trig_en,
                set_trig_parameter,
                read_collect_status,
                read_src_data,
                set_pre_tri,
                set_pwmv,
            })
        }
    }
}

/// Run one foreign call behind an unwind boundary.
fn guarded<T>(call: &'static str, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
        tracing::error!("Native fault during {call}");
        DeviceError::NativeFault { call }
    })
}

impl VendorApi for RealVendor {
    fn connect(&self, index: u16) -> Result<bool, DeviceError> {
        guarded("DevConnect", || unsafe { (self.dev_connect)(index) })
    }

    fn init(&self, index: u16) -> Result<bool, DeviceError> {
        guarded("InitDevice", || unsafe { (self.init_device)(index) })
    }

    fn set_sample_rate(&self, index: u16, code: u16) -> Result<i16, DeviceError> {
        guarded("Set_Sample_Rate", || unsafe {
            (self.set_sample_rate)(index, code)
        })
    }

    fn set_sample_depth(&self, index: u16, depth: u32) -> Result<i16, DeviceError> {
        guarded("Set_SampleDepth", || unsafe {
            (self.set_sample_depth)(index, depth)
        })
    }

    fn set_pwm_voltage(&self, index: u16, low: f64, high: f64) -> Result<i16, DeviceError> {
        match self.set_pwmv {
            Some(f) => guarded("Set_PWMV", || unsafe { f(index, low, high) }),
            None => Ok(0),
        }
    }

    fn enable_trigger(&self, index: u16, enabled: i16) -> Result<i16, DeviceError> {
        guarded("Set_Trig_En", || unsafe {
            (self.set_trig_en)(index, enabled, 0)
        })
    }

    fn set_trigger_parameter(&self, index: u16, params: &TriggerParams) -> Result<i16, DeviceError> {
        guarded("Set_Trig_Parameter", || unsafe {
            (self.set_trig_parameter)(index, 0, params)
        })
    }

    fn set_pre_trigger(&self, index: u16, percent: u16) -> Result<i16, DeviceError> {
        guarded("Set_Pre_Tri", || unsafe {
            (self.set_pre_tri)(index, percent)
        })
    }

    fn start_capture(&self, index: u16) -> Result<bool, DeviceError> {
        guarded("SetCmdLA", || unsafe { (self.set_cmd_la)(index) })
    }

    fn read_status(&self, index: u16) -> Result<u32, DeviceError> {
        guarded("ReadCollectStatus", || unsafe {
            (self.read_collect_status)(index)
        })
    }

    fn read_samples(
        &self,
        index: u16,
        buf: &mut [u32],
        pre_trigger: u16,
    ) -> Result<bool, DeviceError> {
        let ptr = buf.as_mut_ptr();
        let depth = buf.len() as u32;
        guarded("ReadSrcData", || unsafe {
            (self.read_src_data)(index, ptr, depth, pre_trigger)
        })
    }

    fn supports_voltage_threshold(&self) -> bool {
        self.set_pwmv.is_some()
    }
}
