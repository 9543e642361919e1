//! Error taxonomy shared by every layer of the extension runtime.

/// Extension runtime errors
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// Malformed or incomplete manifest, request or config
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Checksum mismatch: expected={expected}, actual={actual}")]
    Integrity { expected: String, actual: String },

    /// Binary open, symbol resolution or constructor failure
    #[error("Load failed: {0}")]
    Load(String),

    #[error("Extension ID mismatch: manifest={manifest}, extension={instance}")]
    Mismatch { manifest: String, instance: String },

    #[error("Extension {id} declares capability {capability} but does not implement it")]
    CapabilityMismatch { id: String, capability: String },

    /// Failure raised by extension code during a lifecycle call
    #[error("Extension {id} failed to {operation}: {message}")]
    Lifecycle {
        id: String,
        operation: &'static str,
        message: String,
    },

    #[error("Config field {field} {message}")]
    Schema { field: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Extension {id} is not ready (state: {state})")]
    InvalidState { id: String, state: String },

    #[error("Extension {id} does not implement {capability}")]
    Unsupported { id: String, capability: String },

    #[error("Input text is empty")]
    EmptyInput,

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The remote service could not be reached at all
    #[error("Transport error: {0}")]
    Transport(String),

    /// A gateway answered in place of the service
    #[error("Service unreachable: {0}")]
    ServiceUnreachable(String),

    /// The remote service answered and refused the operation
    #[error("Rejected [{code}]: {message}")]
    Rejected { code: String, message: String },

    #[error("Extension is incompatible with this platform: {message}. Recompile it for {platform}")]
    PlatformIncompatible { platform: String, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Result type for extension operations
pub type Result<T> = std::result::Result<T, ExtensionError>;

impl ExtensionError {
    /// Machine-readable code carried by both remote transports.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Integrity { .. } => "INTEGRITY_ERROR",
            Self::Load(_) => "LOAD_ERROR",
            Self::Mismatch { .. } | Self::CapabilityMismatch { .. } => "MISMATCH_ERROR",
            Self::Lifecycle { .. } => "LIFECYCLE_ERROR",
            Self::Schema { .. } => "SCHEMA_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRegistered(_) => "CONFLICT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::EmptyInput => "EMPTY_INPUT",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::ServiceUnreachable(_) => "SERVICE_UNREACHABLE",
            Self::Rejected { code, .. } => code,
            Self::PlatformIncompatible { .. } => "PLATFORM_INCOMPATIBLE",
            Self::Cancelled(_) => "CANCELLED",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Zip(_) => "ARCHIVE_ERROR",
        }
    }

    /// True when the call never reached the service, so retrying may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ServiceUnreachable(_))
    }

    /// Wrap a failure coming out of extension code.
    pub fn lifecycle(id: impl Into<String>, operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Lifecycle {
            id: id.into(),
            operation,
            message: err.to_string(),
        }
    }

    /// Rebuild a rejection received from a remote service.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }
}
