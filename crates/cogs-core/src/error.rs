//! Error types for cogs

use thiserror::Error;

/// Main error type for cogs
#[derive(Error, Debug)]
pub enum CogsError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No device with this number is attached
    #[error("Device not found: {0}")]
    DeviceNotFound(u32),

    /// The process does not exist (any more)
    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    /// The process runs on the host, not inside a container
    #[error("Process {0} does not belong to a container")]
    NotContainerized(u32),

    /// The container runtime does not know this container or address
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// No owner label could be found for a container
    #[error("Owner not found for container: {0}")]
    OwnerNotFound(String),

    /// Admission deadline elapsed before enough devices were free
    #[error("Timed out waiting for {requested} device(s), {available} available")]
    Timeout { requested: u32, available: u32 },

    /// The request can never be satisfied on this node
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed client request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The caller does not hold the claim it tries to change
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A collaborator (container runtime, monitoring tool) failed
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Malformed telemetry line
    #[error("Parse error: {0}")]
    Parse(String),

    /// Wrong method or malformed RPC frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CogsError {
    /// Whether this error means "nothing matched" rather than "something broke"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CogsError::DeviceNotFound(_)
                | CogsError::ProcessNotFound(_)
                | CogsError::NotContainerized(_)
                | CogsError::ContainerNotFound(_)
                | CogsError::OwnerNotFound(_)
        )
    }
}

/// Result type for cogs operations
pub type CogsResult<T> = Result<T, CogsError>;

impl From<serde_json::Error> for CogsError {
    fn from(err: serde_json::Error) -> Self {
        CogsError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CogsError {
    fn from(err: toml::de::Error) -> Self {
        CogsError::Config(err.to_string())
    }
}
