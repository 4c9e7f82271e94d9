use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::rpc::StatusCode;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to start plugin process: {0}")]
    Launch(String),

    #[error("Plugin handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Plugin does not provide a supported interface: {0}")]
    UnsupportedPluginInterface(String),

    #[error("Plugin unavailable: {0}")]
    Unavailable(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Internal plugin error: {0}")]
    Internal(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Failed to start plugin '{name}': {source}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<PluginError>,
    },

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Plugin returned {code:?}: {message}")]
    Remote { code: StatusCode, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PluginError {
    /// Status code reported to callers for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            PluginError::Validation(_) | PluginError::Config(_) => StatusCode::InvalidArgument,
            PluginError::NotFound(_) => StatusCode::NotFound,
            PluginError::Unavailable(_) | PluginError::Transport(_) => StatusCode::Unavailable,
            PluginError::Unimplemented(_) | PluginError::UnsupportedPluginInterface(_) => {
                StatusCode::Unimplemented
            }
            PluginError::Cancelled => StatusCode::Cancelled,
            PluginError::DeadlineExceeded => StatusCode::DeadlineExceeded,
            PluginError::Remote { code, .. } => *code,
            PluginError::StartFailed { source, .. } => source.code(),
            PluginError::Launch(_)
            | PluginError::HandshakeFailed(_)
            | PluginError::Internal(_)
            | PluginError::AlreadyRegistered(_)
            | PluginError::InvalidState(_)
            | PluginError::Io(_) => StatusCode::Internal,
        }
    }

    /// True when the caller should degrade to the fallback data source.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PluginError::Unavailable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plugin not found at {}", .0.display())]
    PluginNotFound(PathBuf),

    #[error("plugin path {} is a directory", .0.display())]
    PluginIsDirectory(PathBuf),

    #[error("plugin file {} is empty", .0.display())]
    PluginEmpty(PathBuf),

    #[error("plugin file {} is not executable", .0.display())]
    PluginNotExecutable(PathBuf),

    #[error("cannot inspect plugin {}: {reason}", path.display())]
    Inaccessible { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

impl TransportError {
    /// The frame itself could not be encoded. Nothing was written, so the stream is
    /// still usable.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, TransportError::FrameTooLarge { .. } | TransportError::InvalidFrame(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::ReceiveFailed(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;
