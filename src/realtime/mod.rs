//! Realtime request/response channel

pub mod channel;
pub mod error;

pub use channel::{channel_url, ChannelEvent, ChannelState, Closed, Idle, Open, RealtimeClient};
pub use error::RealtimeError;
