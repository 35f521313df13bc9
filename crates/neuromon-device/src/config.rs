//! Per-device configuration files.
//!
//! Plain `key=value` lines with `#` comments. Parsing is forgiving by
//! contract: malformed lines and out-of-range values are skipped and the
//! previous value survives. A missing file is created with defaults so an
//! operator always has something to edit.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const CHANNELS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub sample_rate_code: u16,
    pub sample_depth: u32,
    pub scan_interval_ms: u32,
    pub voltage_threshold: f64,
    pub enable_trigger: bool,
    pub trigger_channel: u16,
    pub trigger_rising_edge: bool,
    pub enabled: bool,
    pub name: String,
    pub channel_names: Vec<String>,
    pub config_path: PathBuf,
}

impl DeviceConfig {
    /// Built-in defaults for one device slot.
    pub fn defaults_for(index: usize) -> Self {
        let channel_names = (0..CHANNELS)
            .map(|ch| {
                if ch < 16 {
                    format!("A{ch}")
                } else {
                    format!("B{}", ch - 16)
                }
            })
            .collect();

        Self {
            sample_rate_code: 8,
            sample_depth: 100_000,
            scan_interval_ms: 100,
            voltage_threshold: 0.98,
            enable_trigger: false,
            trigger_channel: 0,
            trigger_rising_edge: true,
            enabled: true,
            name: String::new(),
            channel_names,
            config_path: PathBuf::from(format!("logic_config_{index}.txt")),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate_code <= 12
            && (1_000..=32_000_000).contains(&self.sample_depth)
            && (10..=5_000).contains(&self.scan_interval_ms)
            && (0.5..=5.0).contains(&self.voltage_threshold)
            && self.trigger_channel <= 31
    }

    /// Device sample rate in S/s for the current rate code.
    ///
    /// Only codes 0..=2 have documented mappings; every other code runs
    /// the hardware at its 100 MS/s default. Do not interpolate the gap.
    pub fn sample_rate_hz(&self) -> u64 {
        match self.sample_rate_code {
            0 => 1_000_000,
            1 => 2_000_000,
            2 => 5_000_000,
            _ => 100_000_000,
        }
    }

    /// Merge recognized keys from the config file into `self`.
    pub fn load_from_disk(&mut self) -> io::Result<()> {
        let contents = fs::read_to_string(&self.config_path)?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "sample_rate_code" => {
                    if let Ok(code) = value.parse::<u16>() {
                        if code <= 12 {
                            self.sample_rate_code = code;
                        }
                    }
                }
                "sample_depth" => {
                    if let Ok(depth) = value.parse::<u32>() {
                        if (1_000..=32_000_000).contains(&depth) {
                            self.sample_depth = depth;
                        }
                    }
                }
                "scan_interval_ms" => {
                    if let Ok(interval) = value.parse::<u32>() {
                        if (10..=5_000).contains(&interval) {
                            self.scan_interval_ms = interval;
                        }
                    }
                }
                "voltage_threshold" => {
                    if let Ok(threshold) = value.parse::<f64>() {
                        if (0.5..=5.0).contains(&threshold) {
                            self.voltage_threshold = threshold;
                        }
                    }
                }
                "enable_trigger" => self.enable_trigger = parse_flag(value),
                "trigger_channel" => {
                    if let Ok(channel) = value.parse::<u16>() {
                        if channel <= 31 {
                            self.trigger_channel = channel;
                        }
                    }
                }
                "trigger_rising_edge" => self.trigger_rising_edge = parse_flag(value),
                "enabled" => self.enabled = parse_flag(value),
                "name" => self.name = value.to_string(),
                _ => {
                    if let Some(rest) = key.strip_prefix("channel_") {
                        if let Ok(ch) = rest.parse::<usize>() {
                            if ch < CHANNELS {
                                self.channel_names[ch] = value.to_string();
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn save(&self) -> io::Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "# Logic analyzer configuration");
        let _ = writeln!(
            out,
            "# Sample rate codes: 0=1MHz, 1=2MHz, 2=5MHz, others=100MHz"
        );
        let _ = writeln!(out, "sample_rate_code={}", self.sample_rate_code);
        let _ = writeln!(out, "sample_depth={}", self.sample_depth);
        let _ = writeln!(out, "scan_interval_ms={}", self.scan_interval_ms);
        let _ = writeln!(out, "voltage_threshold={}", self.voltage_threshold);
        let _ = writeln!(out, "enable_trigger={}", u8::from(self.enable_trigger));
        let _ = writeln!(out, "trigger_channel={}", self.trigger_channel);
        let _ = writeln!(
            out,
            "trigger_rising_edge={}",
            u8::from(self.trigger_rising_edge)
        );
        let _ = writeln!(out, "enabled={}", u8::from(self.enabled));
        if !self.name.is_empty() {
            let _ = writeln!(out, "name={}", self.name);
        }
        for (ch, name) in self.channel_names.iter().enumerate() {
            let _ = writeln!(out, "channel_{ch}={name}");
        }

        fs::write(&self.config_path, out)
    }

    /// Load the device's config file, creating it with defaults when
    /// absent.
    pub fn load_or_create(index: usize) -> Self {
        Self::load_or_create_in(index, Path::new("."))
    }

    /// Like [`DeviceConfig::load_or_create`], with the file rooted in
    /// `dir`.
    pub fn load_or_create_in(index: usize, dir: &Path) -> Self {
        let mut config = Self::defaults_for(index);
        config.config_path = dir.join(format!("logic_config_{index}.txt"));
        match config.load_from_disk() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Err(e) = config.save() {
                    tracing::warn!(
                        "Could not write default config {}: {e}",
                        config.config_path.display()
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Could not read config {}: {e}; using defaults",
                    config.config_path.display()
                );
            }
        }
        config
    }

    /// Whether moving from `previous` to `self` requires reprogramming
    /// the hardware. Channel names, device name, the enabled flag and the
    /// scan interval are host-side only.
    pub fn needs_device_reapply(&self, previous: &Self) -> bool {
        self.sample_rate_code != previous.sample_rate_code
            || self.sample_depth != previous.sample_depth
            || self.voltage_threshold != previous.voltage_threshold
            || self.enable_trigger != previous.enable_trigger
            || self.trigger_channel != previous.trigger_channel
            || self.trigger_rising_edge != previous.trigger_rising_edge
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Modification time of a config file, when it exists.
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
