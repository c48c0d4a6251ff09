use thiserror::Error;

/// Andock error types
#[derive(Error, Debug)]
pub enum AndockError {
    /// Registry unreachable or returned a server error
    #[error("Network error: {endpoint} - {message}")]
    Network { endpoint: String, message: String },

    /// Token exchange or registry access rejected
    #[error("Authentication failed: {endpoint} - {message}")]
    Auth { endpoint: String, message: String },

    /// Resource does not exist
    #[error("No such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Downloaded content hash differs from the declared digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Extraction or blob write failure
    #[error("Disk error: {0}")]
    Disk(String),

    /// Lifecycle operation not permitted from the current status
    #[error("Cannot {operation} container {id}: container is {from}")]
    InvalidStateTransition {
        id: String,
        from: String,
        operation: &'static str,
    },

    /// Sandbox backend failed to start, exec or terminate
    #[error("Sandbox error: {id} - {message}")]
    Sandbox { id: String, message: String },

    /// Manifest index has no entry for the host platform
    #[error("No matching platform for {reference}: {os}/{architecture}")]
    NoMatchingPlatform {
        reference: String,
        architecture: String,
        os: String,
    },

    /// Name or reference already in use
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AndockError {
    /// Whether a pull should move on to the next mirror after this error.
    pub fn is_mirror_retryable(&self) -> bool {
        matches!(
            self,
            AndockError::Network { .. }
                | AndockError::Timeout(_)
                | AndockError::Auth { .. }
                | AndockError::NotFound { .. }
        )
    }

    /// Stable name of the error kind, used in streamed error details.
    pub fn kind(&self) -> &'static str {
        match self {
            AndockError::Network { .. } => "NetworkError",
            AndockError::Auth { .. } => "AuthError",
            AndockError::NotFound { .. } => "NotFoundError",
            AndockError::DigestMismatch { .. } => "DigestMismatchError",
            AndockError::Disk(_) => "DiskError",
            AndockError::InvalidStateTransition { .. } => "InvalidStateTransition",
            AndockError::Sandbox { .. } => "SandboxError",
            AndockError::NoMatchingPlatform { .. } => "NoMatchingPlatform",
            AndockError::Conflict(_) => "Conflict",
            AndockError::InvalidRequest(_) => "InvalidRequest",
            AndockError::Cancelled(_) => "Cancelled",
            AndockError::Timeout(_) => "Timeout",
            AndockError::Config(_) => "ConfigError",
            AndockError::Serialization(_) => "SerializationError",
            AndockError::Io(_) => "IoError",
        }
    }

    /// Produce an owned copy of this error.
    ///
    /// Terminal results shared by coalesced pulls are handed to every
    /// subscriber. `std::io::Error` is not `Clone`, so I/O errors become
    /// `Disk` errors carrying the same message.
    pub fn duplicate(&self) -> AndockError {
        match self {
            AndockError::Network { endpoint, message } => AndockError::Network {
                endpoint: endpoint.clone(),
                message: message.clone(),
            },
            AndockError::Auth { endpoint, message } => AndockError::Auth {
                endpoint: endpoint.clone(),
                message: message.clone(),
            },
            AndockError::NotFound { kind, id } => AndockError::NotFound {
                kind: *kind,
                id: id.clone(),
            },
            AndockError::DigestMismatch { expected, actual } => AndockError::DigestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            AndockError::Disk(m) => AndockError::Disk(m.clone()),
            AndockError::InvalidStateTransition {
                id,
                from,
                operation,
            } => AndockError::InvalidStateTransition {
                id: id.clone(),
                from: from.clone(),
                operation: *operation,
            },
            AndockError::Sandbox { id, message } => AndockError::Sandbox {
                id: id.clone(),
                message: message.clone(),
            },
            AndockError::NoMatchingPlatform {
                reference,
                architecture,
                os,
            } => AndockError::NoMatchingPlatform {
                reference: reference.clone(),
                architecture: architecture.clone(),
                os: os.clone(),
            },
            AndockError::Conflict(m) => AndockError::Conflict(m.clone()),
            AndockError::InvalidRequest(m) => AndockError::InvalidRequest(m.clone()),
            AndockError::Cancelled(m) => AndockError::Cancelled(m.clone()),
            AndockError::Timeout(m) => AndockError::Timeout(m.clone()),
            AndockError::Config(m) => AndockError::Config(m.clone()),
            AndockError::Serialization(m) => AndockError::Serialization(m.clone()),
            AndockError::Io(e) => AndockError::Disk(e.to_string()),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        AndockError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for AndockError {
    fn from(err: serde_json::Error) -> Self {
        AndockError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AndockError {
    fn from(err: serde_yaml::Error) -> Self {
        AndockError::Serialization(err.to_string())
    }
}

/// Result type alias for andock operations
pub type Result<T> = std::result::Result<T, AndockError>;
