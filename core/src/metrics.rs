//! Periodic resource and connectivity samples.

use serde::{Deserialize, Serialize};

/// Remote-session connectivity as reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// One metrics upload, serialized as the JSON body of `POST /metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Terminal hardware address.
    pub mac: String,
    /// CPU utilization in percent.
    pub cpu_usage: f32,
    /// Memory utilization in percent.
    pub mem_percent: f32,
    /// Bytes received on all interfaces since boot.
    pub rx_bytes: u64,
    /// Bytes transmitted on all interfaces since boot.
    pub tx_bytes: u64,
    #[serde(rename = "rdp_status")]
    pub session: SessionStatus,
    /// Seconds since boot.
    pub uptime: u64,
}

/// Memory usage percentage, rounded to one decimal.
pub fn memory_percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((used as f64 / total as f64) * 1000.0).round() as f32 / 10.0
}
