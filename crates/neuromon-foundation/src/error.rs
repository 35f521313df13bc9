use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Device subsystem error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

/// Errors produced at or below the vendor-library boundary.
///
/// Every native call is converted into one of these; nothing from the
/// foreign side (panics included) crosses further up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Vendor library unusable: {0}")]
    LibraryLoad(String),

    #[error("Device {index} not found or busy")]
    ConnectFail { index: u16 },

    #[error("Device {index} rejected configuration: {what} (status {status})")]
    ConfigureFail {
        index: u16,
        what: &'static str,
        status: i16,
    },

    #[error("Capture did not complete within {timeout_ms} ms")]
    CaptureTimeout { timeout_ms: u64 },

    #[error("Sample read failed on device {index}")]
    ReadFail { index: u16 },

    #[error("Native fault contained at the library boundary: {call}")]
    NativeFault { call: &'static str },

    #[error("Adapter used before a successful open")]
    NotOpen,

    #[error("Adapter is in a terminal state after failed recovery")]
    Terminal,
}

impl DeviceError {
    /// Terminal errors poison the adapter: every later call returns
    /// `Terminal` until the adapter is dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceError::LibraryLoad(_) | DeviceError::Terminal)
    }
}
