//! Error types for RelayKernel.

use thiserror::Error;

/// Result type for RelayKernel operations.
pub type Result<T> = std::result::Result<T, RelayKernelError>;

/// Errors that can occur while dispatching commands to a device queue.
///
/// Submission errors are one-shot: the engine never retries a rejected
/// submission. Every variant carries enough context to be logged and
/// delivered to the requester as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayKernelError {
    /// The device queue rejected a kernel launch submission.
    #[error("Kernel launch submission failed: {0}")]
    LaunchSubmission(String),

    /// The device queue rejected a buffer read or write submission.
    #[error("Buffer transfer submission failed: {0}")]
    TransferSubmission(String),

    /// Registering the completion callback on a token failed.
    #[error("Completion callback registration failed: {0}")]
    CallbackRegistration(String),

    /// Flushing the device queue failed. Work already submitted remains
    /// valid, so this is never fatal to an in-flight command.
    #[error("Queue flush failed: {0}")]
    Flush(String),

    /// The device reported a terminal error status to a completion callback.
    #[error("Device reported error status {0}")]
    Device(i32),

    /// Command protocol misuse or a malformed output buffer.
    #[error("Command error: {0}")]
    Command(String),

    /// Invalid launch or runtime configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device registry error.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Requested backend is not available in this build.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// The response channel closed before a reply was delivered.
    #[error("Response channel closed before delivery")]
    ChannelClosed,
}

impl RelayKernelError {
    /// Create a launch submission error.
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::LaunchSubmission(msg.into())
    }

    /// Create a transfer submission error.
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferSubmission(msg.into())
    }

    /// Create a callback registration error.
    pub fn callback(msg: impl Into<String>) -> Self {
        Self::CallbackRegistration(msg.into())
    }

    /// Create a flush error.
    pub fn flush(msg: impl Into<String>) -> Self {
        Self::Flush(msg.into())
    }

    /// Create a command error.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a registry error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }
}
