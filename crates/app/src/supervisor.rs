//! Process orchestration: sequential device bring-up, worker and
//! exporter lifecycles, cooperative shutdown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use neuromon_device::{DeviceAdapter, DeviceConfig, DeviceIdentity, VendorApi};
use neuromon_foundation::{AppError, AppState, DeviceError, SharedClock, ShutdownToken, StateManager};

use crate::exporter::{ensure_output_dir, Exporter};
use crate::state::{DeviceState, SharedAnalyzerState};
use crate::worker::{ConfigPollGate, DeviceWorker, WorkerEvent};

/// Pause between sequential device connects; back-to-back enumeration
/// overloads the USB bus.
const CONNECT_PAUSE: Duration = Duration::from_millis(500);
/// How long shutdown waits for worker threads before abandoning them.
const JOIN_BUDGET: Duration = Duration::from_secs(5);
/// Exporter panics tolerated before shutdown is forced.
const MAX_EXPORTER_RESTARTS: usize = 3;

/// Per-device vendor API constructor; `Real` in production, `Mock` in
/// tests.
pub type AdapterFactory =
    Box<dyn Fn(u16) -> Result<Box<dyn VendorApi>, DeviceError> + Send + Sync>;

pub struct SupervisorConfig {
    pub device_count: usize,
    pub output_dir: PathBuf,
    /// Directory holding the per-device `logic_config_<n>.txt` files.
    pub config_dir: PathBuf,
    pub export_period: Duration,
}

pub struct Supervisor {
    config: SupervisorConfig,
    factory: AdapterFactory,
    shared: Arc<SharedAnalyzerState>,
    shutdown: ShutdownToken,
    clock: SharedClock,
    lifecycle: StateManager,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        factory: AdapterFactory,
        shutdown: ShutdownToken,
        clock: SharedClock,
    ) -> Self {
        let shared = SharedAnalyzerState::new(config.device_count);
        Self {
            config,
            factory,
            shared,
            shutdown,
            clock,
            lifecycle: StateManager::new(),
        }
    }

    /// Handle for the display process and for tests.
    pub fn shared(&self) -> Arc<SharedAnalyzerState> {
        self.shared.clone()
    }

    pub fn run(&mut self) -> Result<(), AppError> {
        ensure_output_dir(&self.config.output_dir)?;

        let device_configs: Vec<DeviceConfig> = (0..self.config.device_count)
            .map(|i| DeviceConfig::load_or_create_in(i, &self.config.config_dir))
            .collect();

        let adapters = self.connect_devices(&device_configs);
        tracing::info!(
            "{} of {} devices connected",
            self.shared.active_devices(),
            self.config.device_count
        );

        self.lifecycle.transition(AppState::Running)?;

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let gate = Arc::new(ConfigPollGate::new(&self.clock));
        let mut workers = Vec::new();
        for (index, adapter) in adapters.into_iter().enumerate() {
            let Some(adapter) = adapter else { continue };
            let worker = DeviceWorker::new(
                index,
                self.shared.clone(),
                adapter,
                device_configs[index].clone(),
                self.shutdown.clone(),
                self.clock.clone(),
                gate.clone(),
            )
            .with_events(events_tx.clone());
            workers.push(worker.spawn());
        }

        let exporter = self.spawn_exporter_supervised();

        // Stay up until shutdown even with zero devices: the exporter
        // keeps the output files fresh for the display.
        while !self.shutdown.is_requested() {
            match events_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(WorkerEvent::Terminated { index }) => {
                    tracing::error!(
                        "Device {index} gave up; {} devices remain active",
                        self.shared.active_devices()
                    );
                }
                Ok(WorkerEvent::Stopped { index }) => {
                    tracing::debug!("Device {index} worker exited cleanly");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("Shutting down");
        self.lifecycle.transition(AppState::Stopping)?;
        self.shutdown.request();
        self.join_workers(workers);
        let _ = exporter.join();
        self.lifecycle.transition(AppState::Stopped)?;
        Ok(())
    }

    /// Bring devices up one at a time: open, initialize, apply config,
    /// publish the initial state. Failures leave the slot disconnected.
    fn connect_devices(&self, configs: &[DeviceConfig]) -> Vec<Option<DeviceAdapter>> {
        let mut adapters = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            if self.shutdown.is_requested() {
                adapters.push(None);
                continue;
            }
            if !config.enabled {
                tracing::info!("Device {index}: disabled in configuration, skipping");
                adapters.push(None);
                continue;
            }

            adapters.push(self.bring_up_device(index, config));
            self.shutdown.sleep(CONNECT_PAUSE);
        }

        adapters
    }

    fn bring_up_device(&self, index: usize, config: &DeviceConfig) -> Option<DeviceAdapter> {
        let api = match (self.factory)(index as u16) {
            Ok(api) => api,
            Err(e) => {
                tracing::error!("Device {index}: vendor library unavailable: {e}");
                return None;
            }
        };

        let mut adapter = DeviceAdapter::new(api, index as u16, self.clock.clone());
        let result = adapter
            .open()
            .and_then(|()| adapter.initialize())
            .and_then(|()| adapter.apply_configuration(config));

        match result {
            Ok(()) => {
                let identity = adapter
                    .identity()
                    .cloned()
                    .unwrap_or_else(|| DeviceIdentity {
                        serial: "Unknown".into(),
                        model: "Unknown".into(),
                        firmware: "Unknown".into(),
                    });
                tracing::info!(
                    "Device {index}: connected ({} {})",
                    identity.model,
                    identity.serial
                );

                let mut state = DeviceState::default();
                state.connected = true;
                state.active = true;
                state.serial = identity.serial;
                state.model = identity.model;
                state.firmware = identity.firmware;
                state.channel_names = config.channel_names.clone();
                self.shared.publish(index, Arc::new(state));
                self.shared.note_device_activated();
                Some(adapter)
            }
            Err(e) => {
                tracing::warn!("Device {index}: not available: {e}");
                None
            }
        }
    }

    /// The exporter runs under its own supervisor thread: a panic is
    /// caught and the exporter restarted, up to a limit.
    fn spawn_exporter_supervised(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let output_dir = self.config.output_dir.clone();
        let period = self.config.export_period;
        let shutdown = self.shutdown.clone();
        let clock = self.clock.clone();

        thread::Builder::new()
            .name("exporter-supervisor".into())
            .spawn(move || {
                let mut restarts = 0;
                loop {
                    let exporter = Exporter::new(
                        shared.clone(),
                        output_dir.clone(),
                        shutdown.clone(),
                        clock.clone(),
                    )
                    .with_period(period);

                    match catch_unwind(AssertUnwindSafe(|| exporter.run())) {
                        Ok(()) => break,
                        Err(_) => {
                            restarts += 1;
                            if restarts > MAX_EXPORTER_RESTARTS {
                                tracing::error!(
                                    "Exporter panicked {restarts} times; forcing shutdown"
                                );
                                shutdown.request();
                                break;
                            }
                            tracing::error!(
                                "Exporter panicked; restarting ({restarts}/{MAX_EXPORTER_RESTARTS})"
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn exporter supervisor thread")
    }

    fn join_workers(&self, workers: Vec<JoinHandle<()>>) {
        let deadline = Instant::now() + JOIN_BUDGET;
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("A worker thread did not stop within the shutdown budget");
            }
        }
    }
}
