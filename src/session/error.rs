//! Error definitions for the session module

use thiserror::Error;

/// Failures while acquiring a remote controller
///
/// A controller that is simply not connected yet is not an error; accessors
/// return `None` for that case.
#[derive(Debug, Clone, Error)]
pub enum BindingError {
    /// The remote session refused or dropped the connection attempt
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No session matched the descriptor
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),
}

/// Failures talking to a running playback client
#[derive(Debug, Error)]
pub enum ClientError {
    /// The control task is gone
    #[error("Client channel closed: {0}")]
    ChannelClosed(String),
}
