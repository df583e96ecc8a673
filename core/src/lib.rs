//! Thinboot Core - Shared Types for Image Assembly and Boot Supervision
//!
//! This crate holds the data model shared by the build-host assembler, the
//! in-image boot supervisor, and the operator CLI.

pub mod artifact;
pub mod component;
pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod params;
pub mod variant;
pub mod wire;

// Re-export commonly used types
pub use artifact::{Codec, ImageArtifact};
pub use component::{Component, ComponentKind};
pub use config::{AssemblyConfig, SupervisorConfig, ToolPaths};
pub use error::{BootFailure, Result, ThinbootError};
pub use log::{LogRecord, Severity};
pub use metrics::{MetricsSample, SessionStatus};
pub use params::{BootParameterSet, PeripheralFlags, Resolution};
pub use variant::{DriverRequirement, FirmwareRequirement, HardwareVariant, VariantManifest};
pub use wire::{normalize_mac, Credentials};

/// Thinboot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
