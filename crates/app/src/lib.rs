//! Runtime wiring for the neuromon binary: shared analyzer state, the
//! per-device capture workers, the exporter and the supervisor.

pub mod exporter;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use exporter::Exporter;
pub use state::{ChannelMetrics, DeviceState, SharedAnalyzerState, Snapshot};
pub use supervisor::{AdapterFactory, Supervisor, SupervisorConfig};
pub use worker::{ConfigPollGate, DeviceWorker, WorkerEvent};
