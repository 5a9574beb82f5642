pub mod accumulator;
pub mod bridge;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod pool;
pub mod record;

pub use accumulator::PickledAccumulator;
pub use bridge::{OutputFrames, Partition, RecordStream, TaskBridge, WorkerCommand};
pub use broadcast::Broadcast;
pub use config::BridgeConfig;
pub use context::{TaskContext, TaskMetrics};
pub use error::BridgeError;
pub use host::{HostRuntime, LocalStorage, MemoryManagers, NoopMemoryManagers};
pub use pool::{ProcessLauncher, Worker, WorkerLauncher, WorkerPool};
pub use record::Record;
