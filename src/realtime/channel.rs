//! Realtime request/response channel over WebSocket
//!
//! The client is a typestate machine: an `Idle` client connects into an
//! `Open` one, which sends requests and finally disconnects into `Closed`.
//! Inbound frames are delivered as [`ChannelEvent`]s on the receiver returned
//! by [`RealtimeClient::connect`].

use chrono::{DateTime, Local};
use futures_util::{SinkExt, StreamExt};
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::error::RealtimeError;
use crate::config::RealtimeConfig;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Message {
        text: String,
        received_at: DateTime<Local>,
    },
    Disconnected,
    Error(String),
}

impl ChannelEvent {
    /// Parses a text message as JSON; `None` for other events or invalid JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        match self {
            ChannelEvent::Message { text, .. } => serde_json::from_str(text).ok(),
            _ => None,
        }
    }
}

/// `ws[s]://{endpoint}/ws`
pub fn channel_url(endpoint: &str, secure: bool) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{}://{}/ws", scheme, endpoint.trim_end_matches('/'))
}

#[state]
#[derive(Debug, Clone)]
pub enum ChannelState {
    Idle,
    Open,
    Closed,
}

#[machine]
pub struct RealtimeClient<S: ChannelState> {
    config: RealtimeConfig,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: ChannelState> RealtimeClient<S> {
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }
}

impl RealtimeClient<Idle> {
    pub fn create(config: RealtimeConfig) -> Self {
        Self::new(config, None, Vec::new())
    }

    /// Opens the channel; events start with [`ChannelEvent::Connected`]
    pub async fn connect(
        mut self,
    ) -> Result<(RealtimeClient<Open>, mpsc::Receiver<ChannelEvent>), RealtimeError> {
        if self.config.endpoint.trim().is_empty() {
            return Err(RealtimeError::InvalidEndpoint(self.config.endpoint.clone()));
        }
        let url = channel_url(&self.config.endpoint, self.config.secure);
        info!("Connecting realtime channel to {}", url);

        let (stream, _) = tokio::time::timeout(self.timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| RealtimeError::Timeout(self.config.connect_timeout_secs))?
            .map_err(|e| {
                error!("Realtime connection failed: {}", e);
                RealtimeError::Connect(e.to_string())
            })?;
        let (mut sink, mut source) = stream.split();

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        // cannot fail, the receiver is still in hand
        let _ = events_tx.send(ChannelEvent::Connected).await;

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("Realtime send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Realtime writer finished");
        });

        let reader = tokio::spawn(async move {
            let mut failed = false;
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        debug!("Realtime message: {}", text);
                        let event = ChannelEvent::Message {
                            text,
                            received_at: Local::now(),
                        };
                        if events_tx.send(event).await.is_err() {
                            debug!("Realtime events receiver dropped");
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary frame of {} bytes", data.len());
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Realtime channel closing: {:?}", frame);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Realtime channel failed: {}", e);
                        let _ = events_tx.send(ChannelEvent::Error(e.to_string())).await;
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                info!("Realtime channel closed");
                let _ = events_tx.send(ChannelEvent::Disconnected).await;
            }
        });

        self.outbound = Some(outbound_tx);
        self.tasks = vec![writer, reader];
        Ok((self.transition(), events_rx))
    }
}

impl RealtimeClient<Open> {
    /// Asks the server for the content behind `content_id`
    pub fn send_request(&self, content_id: &str) -> Result<(), RealtimeError> {
        let request = serde_json::json!({ "video_id": content_id });
        self.send_text(request.to_string())?;
        info!("Requested {}", content_id);
        Ok(())
    }

    pub fn send_text(&self, text: String) -> Result<(), RealtimeError> {
        self.outbound
            .as_ref()
            .ok_or(RealtimeError::ChannelClosed)?
            .send(Message::Text(text))
            .map_err(|_| RealtimeError::ChannelClosed)
    }

    /// Closes the channel with a normal close frame
    ///
    /// Waits up to the connect timeout for the server to acknowledge before
    /// tearing the connection down.
    pub async fn disconnect(mut self) -> RealtimeClient<Closed> {
        if let Some(outbound) = self.outbound.take() {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "normal closure".into(),
            }));
            if outbound.send(close).is_err() {
                debug!("Realtime writer already gone");
            }
        }

        let deadline = self.timeout();
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                warn!("Realtime task did not finish in time, aborting");
                task.abort();
            }
        }
        info!("Realtime channel disconnected");
        self.transition()
    }
}

impl RealtimeClient<Closed> {
    /// Returns to `Idle` so the same settings can connect again
    pub fn reset(self) -> RealtimeClient<Idle> {
        self.transition()
    }
}
