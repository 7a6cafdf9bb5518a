//! Remote controller surface
//!
//! Everything the session layer needs from a playback controller: queue
//! inspection and editing, transport commands, listener registration and
//! release. Implementations live on the far side of a [`SessionConnector`].
//!
//! [`SessionConnector`]: super::binding::SessionConnector

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::lifecycle::{Lifecycle, LifecycleState};

/// Playable queue entry; identity is `media_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub media_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl MediaItem {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            title: None,
            uri: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Ready,
    Ended,
}

/// Notifications delivered to [`PlayerListener`]s
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    PlaybackStateChanged(PlaybackState),
    PlayWhenReadyChanged(bool),
    MediaItemTransition(Option<MediaItem>),
    QueueChanged { len: usize },
}

pub trait PlayerListener: Send + Sync {
    fn on_event(&self, event: &PlayerEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Connected playback controller
///
/// Calls are made from the control task only. `release` hands the controller
/// back to the remote session; no other method may be used afterwards.
pub trait PlayerController: Send + Sync + 'static {
    fn media_item_count(&self) -> usize;
    fn media_item_at(&self, index: usize) -> Option<MediaItem>;
    fn current_media_item(&self) -> Option<MediaItem>;
    fn current_media_item_index(&self) -> usize;
    fn play_when_ready(&self) -> bool;
    fn playback_state(&self) -> PlaybackState;

    /// Replaces the queue and positions playback at `start_index`
    fn set_media_items(&self, items: Vec<MediaItem>, start_index: usize);
    fn prepare(&self);
    fn play(&self);
    fn stop(&self);
    fn clear_media_items(&self);

    fn add_listener(&self, listener: Arc<dyn PlayerListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;

    fn release(&self);
}

/// Attaches `listener` to `controller` until `lifecycle` is destroyed
///
/// Returns `None` without touching the controller if the lifecycle already
/// ended.
pub fn register_lifecycle_listener<C: PlayerController>(
    controller: &Arc<C>,
    lifecycle: &Lifecycle,
    listener: Arc<dyn PlayerListener>,
) -> Option<ListenerId> {
    if lifecycle.state().is_destroyed() {
        debug!("Skipping player listener for destroyed lifecycle");
        return None;
    }

    let id = controller.add_listener(listener);
    let controller = controller.clone();
    lifecycle.observe(move |state| {
        if state == LifecycleState::Destroyed {
            debug!("Removing player listener {:?}", id);
            controller.remove_listener(id);
        }
    });
    Some(id)
}
