use thiserror::Error;

/// Thinboot error types
#[derive(Error, Debug)]
pub enum ThinbootError {
    /// Dependency closure could not be computed for a root binary
    #[error("Dependency resolution failed for {path}: {message}")]
    ResolveError { path: String, message: String },

    /// A variant failed validation with at least one critical issue
    #[error("Validation failed for variant {variant}: {critical} critical issue(s)")]
    ValidationFailed { variant: String, critical: usize },

    /// A declared component is absent from the build host
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// Packaging the image tree failed
    #[error("Packaging error: {0}")]
    PackageError(String),

    /// The produced artifact is smaller than the declared minimum
    #[error("Artifact {name} too small: {size} bytes (minimum {minimum})")]
    ArtifactTooSmall { name: String, size: u64, minimum: u64 },

    /// Artifact hash or size does not match its sidecar files
    #[error("Artifact integrity mismatch: {0}")]
    IntegrityError(String),

    /// Unknown hardware variant
    #[error("Unknown hardware variant: {0}")]
    UnknownVariant(String),

    /// Boot-time bring-up error
    #[error("Bring-up error: {0}")]
    BringUpError(String),

    /// Supervised process could not be spawned or awaited
    #[error("Process error: {program} - {message}")]
    ProcessError { program: String, message: String },

    /// Server API call failed
    #[error("Server API error: {endpoint} - {message}")]
    ApiError { endpoint: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ThinbootError {
    fn from(err: serde_json::Error) -> Self {
        ThinbootError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ThinbootError {
    fn from(err: serde_yaml::Error) -> Self {
        ThinbootError::SerializationError(err.to_string())
    }
}

impl ThinbootError {
    /// Whether repeating the failed operation could succeed. Validation and
    /// size failures are properties of the inputs and never change on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ThinbootError::ValidationFailed { .. }
                | ThinbootError::ArtifactTooSmall { .. }
                | ThinbootError::UnknownVariant(_)
                | ThinbootError::ComponentNotFound(_)
                | ThinbootError::ConfigError(_)
        )
    }
}

/// Result type alias for thinboot operations
pub type Result<T> = std::result::Result<T, ThinbootError>;

/// Failure taxonomy of a single boot.
///
/// Fatal failures halt in the emergency diagnostic shell. Session exhaustion
/// is not fatal in that sense: it ends the boot with a reboot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootFailure {
    /// No network interface obtained an address and a default route
    #[error("no network interface came up: {0}")]
    BoundaryCondition(String),

    /// All time sources unreachable
    #[error("clock synchronization failed: {0}")]
    ClockSync(String),

    /// Every display driver candidate failed its liveness check
    #[error("display server failed with every driver: {0}")]
    DisplayStart(String),

    /// Boot token exchange failed
    #[error("credential exchange failed: {0}")]
    CredentialFetch(String),

    /// Remote session retry budget exhausted
    #[error("remote session gave up after {attempts} attempt(s)")]
    Session { attempts: u32 },

    /// Telemetry call failed
    #[error("telemetry delivery failed: {0}")]
    TelemetryDelivery(String),
}

impl BootFailure {
    /// Whether this failure blocks forward progress and must halt in the
    /// emergency shell.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BootFailure::BoundaryCondition(_) | BootFailure::DisplayStart(_)
        )
    }

    /// Whether this failure ends the boot with a reboot.
    pub fn requires_reboot(&self) -> bool {
        matches!(self, BootFailure::Session { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failed_display() {
        let error = ThinbootError::ValidationFailed {
            variant: "intel".to_string(),
            critical: 2,
        };
        assert_eq!(
            error.to_string(),
            "Validation failed for variant intel: 2 critical issue(s)"
        );
    }

    #[test]
    fn test_artifact_too_small_display() {
        let error = ThinbootError::ArtifactTooSmall {
            name: "initrd-amd.img".to_string(),
            size: 1024,
            minimum: 20 * 1024 * 1024,
        };
        assert!(error.to_string().contains("initrd-amd.img"));
        assert!(error.to_string().contains("1024 bytes"));
    }

    #[test]
    fn test_api_error_display() {
        let error = ThinbootError::ApiError {
            endpoint: "/heartbeat".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Server API error: /heartbeat - connection refused"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ThinbootError = io_error.into();
        assert!(matches!(error, ThinbootError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ bad");
        let error: ThinbootError = result.unwrap_err().into();
        assert!(matches!(error, ThinbootError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: ThinbootError = result.unwrap_err().into();
        assert!(matches!(error, ThinbootError::SerializationError(_)));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ThinbootError::PackageError("disk full".into()).is_transient());
        assert!(ThinbootError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "eio")).is_transient());
        assert!(!ThinbootError::ValidationFailed {
            variant: "amd".into(),
            critical: 1
        }
        .is_transient());
        assert!(!ThinbootError::ComponentNotFound("bin/busybox".into()).is_transient());
    }

    #[test]
    fn test_boot_failure_fatality() {
        assert!(BootFailure::BoundaryCondition("eth0".into()).is_fatal());
        assert!(BootFailure::DisplayStart("fbdev".into()).is_fatal());
        assert!(!BootFailure::ClockSync("ntp".into()).is_fatal());
        assert!(!BootFailure::CredentialFetch("404".into()).is_fatal());
        assert!(!BootFailure::TelemetryDelivery("timeout".into()).is_fatal());

        let session = BootFailure::Session { attempts: 10 };
        assert!(!session.is_fatal());
        assert!(session.requires_reboot());
        assert!(!BootFailure::DisplayStart("x".into()).requires_reboot());
    }
}
