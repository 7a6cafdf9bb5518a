use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Invalid endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0}s")]
    Timeout(u64),

    /// The channel is not open anymore
    #[error("Channel closed")]
    ChannelClosed,
}
