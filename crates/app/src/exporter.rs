//! Periodic renderer of the shared state to the output directory.
//!
//! Every tick takes a snapshot and rewrites the four artifacts consumed
//! by the visualization process. Writes are atomic: content lands in a
//! sibling temp file which is flushed and renamed into place, so an
//! external reader never observes a truncated file. Write failures are
//! logged and the tick is skipped; the exporter never gives up.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use neuromon_foundation::{SharedClock, ShutdownToken};

use crate::state::{DeviceState, SharedAnalyzerState, Snapshot, PROBE_CHANNELS};

pub const DEFAULT_EXPORT_PERIOD: Duration = Duration::from_millis(500);

const LOGIC_DATA_FILE: &str = "logic_data.txt";
const TIME_SLICED_FILE: &str = "time_sliced_data.txt";
const PHASE_DATA_FILE: &str = "phase_data.txt";
const FREQUENCY_DATA_FILE: &str = "frequency_data.txt";

pub struct Exporter {
    shared: Arc<SharedAnalyzerState>,
    output_dir: PathBuf,
    period: Duration,
    shutdown: ShutdownToken,
    clock: SharedClock,
}

impl Exporter {
    pub fn new(
        shared: Arc<SharedAnalyzerState>,
        output_dir: PathBuf,
        shutdown: ShutdownToken,
        clock: SharedClock,
    ) -> Self {
        Self {
            shared,
            output_dir,
            period: DEFAULT_EXPORT_PERIOD,
            shutdown,
            clock,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("exporter".into())
            .spawn(move || self.run())
            .expect("failed to spawn exporter thread")
    }

    pub fn run(&self) {
        tracing::info!(
            "Exporter started, writing to {} every {:?}",
            self.output_dir.display(),
            self.period
        );
        loop {
            if let Err(e) = self.tick() {
                tracing::warn!("Export tick skipped: {e}");
            }
            if !self.shutdown.sleep(self.period) {
                break;
            }
        }
        tracing::info!("Exporter stopped");
    }

    /// Render one snapshot to all artifacts.
    pub fn tick(&self) -> io::Result<()> {
        let snapshot = self.shared.snapshot();
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        self.write_atomic(LOGIC_DATA_FILE, &self.render_logic_data(&snapshot, &timestamp))?;
        self.write_atomic(TIME_SLICED_FILE, &self.render_time_sliced(&snapshot))?;
        self.write_atomic(PHASE_DATA_FILE, &self.render_phase_data(&snapshot, &timestamp))?;
        self.write_atomic(FREQUENCY_DATA_FILE, &self.render_frequency_data(&snapshot))?;
        Ok(())
    }

    fn write_atomic(&self, name: &str, contents: &str) -> io::Result<()> {
        let final_path = self.output_dir.join(name);
        let temp_path = self.output_dir.join(format!(".{name}.tmp"));

        let mut file = File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)
    }

    /// Recency-quantized activity: the most recent changes burn hottest.
    fn quantized_activity(&self, state: &DeviceState, channel: usize) -> u8 {
        let Some(changed) = state.recently_changed.get(&channel) else {
            return 0;
        };
        let elapsed = self.clock.now().duration_since(*changed).as_millis();
        match elapsed {
            0..=499 => 100,
            500..=999 => 75,
            1000..=1999 => 50,
            _ => 25,
        }
    }

    fn render_logic_data(&self, snapshot: &Snapshot, timestamp: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Neural Monitor Data - Updated: {timestamp}");
        let _ = writeln!(
            out,
            "# Format: [device_id],[serial],[model],[channel_id],[state],[transitions],[active]"
        );
        let _ = writeln!(out);

        for (id, state) in snapshot.devices.iter().enumerate() {
            if !state.connected {
                continue;
            }

            let _ = writeln!(
                out,
                "DEVICE,{id},{},{},{}",
                state.serial, state.model, state.captures
            );

            for (ch, metrics) in state.channels.iter().enumerate() {
                if metrics.total_transitions == 0 {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "CHANNEL,{ch},{},{},{},{},{}",
                    state.channel_names[ch],
                    metrics.current_state,
                    metrics.transitions,
                    metrics.total_transitions,
                    self.quantized_activity(state, ch)
                );
            }

            for (ch, metrics) in state.channels.iter().take(PROBE_CHANNELS).enumerate() {
                let _ = writeln!(
                    out,
                    "PHASE_DATA,{id},{ch},{:.4},{:.4}",
                    metrics.mean_phase, metrics.phase_variance
                );
            }

            let _ = writeln!(out);
        }

        out
    }

    fn render_time_sliced(&self, snapshot: &Snapshot) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Time-sliced neural activity data");
        let _ = writeln!(
            out,
            "# Format:device_id,channel_id,slice0_activity,slice1_activity,slice2_activity,slice3_activity,slice4_activity"
        );

        for (id, state) in snapshot.devices.iter().enumerate() {
            if !state.connected {
                continue;
            }
            for (ch, metrics) in state.channels.iter().take(PROBE_CHANNELS).enumerate() {
                let _ = write!(out, "{id},{ch}");
                for activity in &metrics.slice_activity {
                    let _ = write!(out, ",{activity:.1}");
                }
                let _ = writeln!(out);
            }
        }

        out
    }

    fn render_phase_data(&self, snapshot: &Snapshot, timestamp: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Phase Data - Updated: {timestamp}");
        let _ = writeln!(
            out,
            "# Format: [device_id],[serial],[model],[channel_id],[meanPhase],[phaseVariance]"
        );
        let _ = writeln!(out);

        for (id, state) in snapshot.devices.iter().enumerate() {
            if !state.connected {
                continue;
            }
            let _ = writeln!(
                out,
                "DEVICE,{id},{}, {},{}",
                state.serial, state.model, state.captures
            );
            for (ch, metrics) in state.channels.iter().take(PROBE_CHANNELS).enumerate() {
                let _ = writeln!(
                    out,
                    "PHASE,{ch},{}, {:.2},{:.2}",
                    state.channel_names[ch], metrics.mean_phase, metrics.phase_variance
                );
            }
        }

        out
    }

    fn render_frequency_data(&self, snapshot: &Snapshot) -> String {
        let mut out = String::new();
        let _ = write!(out, "device,channel");
        for band in 0..neuromon_dsp::BAND_COUNT {
            let _ = write!(out, ",band{band}");
        }
        let _ = writeln!(out);

        for (id, state) in snapshot.devices.iter().enumerate() {
            if !state.connected {
                continue;
            }
            for (ch, metrics) in state.channels.iter().take(PROBE_CHANNELS).enumerate() {
                let _ = write!(out, "{id},{ch}");
                for magnitude in &metrics.band_magnitudes {
                    let _ = write!(out, ",{magnitude:.2}");
                }
                let _ = writeln!(out);
            }
        }

        out
    }
}

/// Create the output directory at startup; the exporter is its only
/// writer afterwards.
pub fn ensure_output_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}
