//! Play queue editing

use tracing::{debug, info};

use super::controller::{MediaItem, PlaybackState, PlayerController};

/// Queue as seen at the moment of a mutation
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub items: Vec<MediaItem>,
    pub current_index: usize,
    pub current_media_id: Option<String>,
    pub was_playing: bool,
}

impl QueueSnapshot {
    pub fn capture<C: PlayerController + ?Sized>(controller: &C) -> Self {
        let items = (0..controller.media_item_count())
            .filter_map(|index| controller.media_item_at(index))
            .collect();

        Self {
            items,
            current_index: controller.current_media_item_index(),
            current_media_id: controller.current_media_item().map(|item| item.media_id),
            was_playing: controller.play_when_ready()
                && controller.playback_state() == PlaybackState::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Nothing in the queue carried the id
    NotInQueue,
    /// The queue became empty; playback stopped
    Cleared,
    /// The playing item was removed; playback moved to `index`
    ReplacedCurrent { index: usize, resumed: bool },
    /// Another item was removed; the current position was kept
    Reapplied { index: usize },
}

pub struct QueueMutator<'a, C: PlayerController + ?Sized> {
    controller: &'a C,
}

impl<'a, C: PlayerController + ?Sized> QueueMutator<'a, C> {
    pub fn new(controller: &'a C) -> Self {
        Self { controller }
    }

    /// Removes every queue entry whose id is `media_id`
    pub fn remove_item(&self, media_id: &str) -> RemovalOutcome {
        let snapshot = QueueSnapshot::capture(self.controller);
        let before = snapshot.items.len();
        let queue: Vec<MediaItem> = snapshot
            .items
            .into_iter()
            .filter(|item| item.media_id != media_id)
            .collect();

        if queue.len() == before {
            debug!("{} is not in the queue", media_id);
            return RemovalOutcome::NotInQueue;
        }

        if queue.is_empty() {
            info!("Queue emptied by removing {}", media_id);
            self.controller.stop();
            self.controller.clear_media_items();
            return RemovalOutcome::Cleared;
        }

        let last = queue.len() - 1;
        if snapshot.current_media_id.as_deref() == Some(media_id) {
            let index = snapshot.current_index.min(last);
            self.controller.set_media_items(queue, index);
            self.controller.prepare();
            if snapshot.was_playing {
                self.controller.play();
            }
            info!(
                "Removed playing item {}, continuing at {} (resumed: {})",
                media_id, index, snapshot.was_playing
            );
            RemovalOutcome::ReplacedCurrent {
                index,
                resumed: snapshot.was_playing,
            }
        } else {
            let index = if snapshot.current_index > last {
                last
            } else {
                snapshot.current_index
            };
            self.controller.set_media_items(queue, index);
            debug!("Removed {}, position kept at {}", media_id, index);
            RemovalOutcome::Reapplied { index }
        }
    }
}
