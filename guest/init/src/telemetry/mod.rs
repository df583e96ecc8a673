//! Log uplink, heartbeat and metrics reporting to the central server.

pub mod api;
pub mod buffer;
pub mod layer;
pub mod tasks;

pub use api::{HttpServerApi, ServerApi};
pub use buffer::LogBuffer;
pub use layer::UplinkLayer;
pub use tasks::{flush_once, retry_failed_once, MetricsSampler, TelemetryTasks};
