//! In-process playback session
//!
//! [`LocalPlayer`] keeps its queue in memory and journals every mutating call,
//! which makes it usable both by the demo binary and by tests.
//! [`LocalConnector`] hands one out after an optional delay.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::binding::{SessionConnector, SessionDescriptor, SessionLink};
use super::controller::{
    ListenerId, MediaItem, PlaybackState, PlayerController, PlayerEvent, PlayerListener,
};
use super::error::BindingError;

/// Mutating calls received by a [`LocalPlayer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCall {
    SetMediaItems { len: usize, start_index: usize },
    Prepare,
    Play,
    Stop,
    ClearMediaItems,
    Release,
}

#[derive(Default)]
struct LocalState {
    queue: Vec<MediaItem>,
    index: usize,
    play_when_ready: bool,
    playback: PlaybackState,
    next_listener: u64,
    listeners: Vec<(ListenerId, Arc<dyn PlayerListener>)>,
    calls: Vec<PlayerCall>,
    release_count: usize,
}

#[derive(Default)]
pub struct LocalPlayer {
    state: Mutex<LocalState>,
    link: Mutex<Option<SessionLink<LocalPlayer>>>,
}

impl LocalPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(queue: Vec<MediaItem>, index: usize) -> Self {
        let player = Self::new();
        {
            let mut state = player.state.lock();
            state.index = index.min(queue.len().saturating_sub(1));
            state.queue = queue;
        }
        player
    }

    /// Route for disconnect notices and custom commands back to the binding
    pub fn attach_link(&self, link: SessionLink<LocalPlayer>) {
        *self.link.lock() = Some(link);
    }

    pub fn link(&self) -> Option<SessionLink<LocalPlayer>> {
        self.link.lock().clone()
    }

    pub fn queue(&self) -> Vec<MediaItem> {
        self.state.lock().queue.clone()
    }

    pub fn calls(&self) -> Vec<PlayerCall> {
        self.state.lock().calls.clone()
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().release_count
    }

    pub fn is_released(&self) -> bool {
        self.release_count() > 0
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Simulates the remote side going away
    pub fn disconnect(&self) -> bool {
        match self.link.lock().take() {
            Some(link) => link.notify_disconnected(),
            None => false,
        }
    }

    fn emit(&self, events: Vec<PlayerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn PlayerListener>> = self
            .state
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for event in &events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }

    fn set_playback(state: &mut LocalState, playback: PlaybackState, events: &mut Vec<PlayerEvent>) {
        if state.playback != playback {
            state.playback = playback;
            events.push(PlayerEvent::PlaybackStateChanged(playback));
        }
    }
}

impl PlayerController for LocalPlayer {
    fn media_item_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn media_item_at(&self, index: usize) -> Option<MediaItem> {
        self.state.lock().queue.get(index).cloned()
    }

    fn current_media_item(&self) -> Option<MediaItem> {
        let state = self.state.lock();
        state.queue.get(state.index).cloned()
    }

    fn current_media_item_index(&self) -> usize {
        self.state.lock().index
    }

    fn play_when_ready(&self) -> bool {
        self.state.lock().play_when_ready
    }

    fn playback_state(&self) -> PlaybackState {
        self.state.lock().playback
    }

    fn set_media_items(&self, items: Vec<MediaItem>, start_index: usize) {
        let events = {
            let mut state = self.state.lock();
            state.calls.push(PlayerCall::SetMediaItems {
                len: items.len(),
                start_index,
            });
            let previous = state.queue.get(state.index).cloned();
            state.index = start_index.min(items.len().saturating_sub(1));
            state.queue = items;

            let mut events = vec![PlayerEvent::QueueChanged {
                len: state.queue.len(),
            }];
            let current = state.queue.get(state.index).cloned();
            if current != previous {
                events.push(PlayerEvent::MediaItemTransition(current));
            }
            events
        };
        self.emit(events);
    }

    fn prepare(&self) {
        let events = {
            let mut state = self.state.lock();
            state.calls.push(PlayerCall::Prepare);
            let mut events = Vec::new();
            if !state.queue.is_empty() {
                Self::set_playback(&mut state, PlaybackState::Ready, &mut events);
            }
            events
        };
        self.emit(events);
    }

    fn play(&self) {
        let events = {
            let mut state = self.state.lock();
            state.calls.push(PlayerCall::Play);
            let mut events = Vec::new();
            if !state.play_when_ready {
                state.play_when_ready = true;
                events.push(PlayerEvent::PlayWhenReadyChanged(true));
            }
            if !state.queue.is_empty() {
                Self::set_playback(&mut state, PlaybackState::Ready, &mut events);
            }
            events
        };
        self.emit(events);
    }

    fn stop(&self) {
        let events = {
            let mut state = self.state.lock();
            state.calls.push(PlayerCall::Stop);
            let mut events = Vec::new();
            Self::set_playback(&mut state, PlaybackState::Idle, &mut events);
            events
        };
        self.emit(events);
    }

    fn clear_media_items(&self) {
        let events = {
            let mut state = self.state.lock();
            state.calls.push(PlayerCall::ClearMediaItems);
            state.queue.clear();
            state.index = 0;
            vec![
                PlayerEvent::QueueChanged { len: 0 },
                PlayerEvent::MediaItemTransition(None),
            ]
        };
        self.emit(events);
    }

    fn add_listener(&self, listener: Arc<dyn PlayerListener>) -> ListenerId {
        let mut state = self.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.calls.push(PlayerCall::Release);
        state.release_count += 1;
        state.listeners.clear();
        debug!("Local player released ({} times)", state.release_count);
    }
}

/// Connects to a fresh [`LocalPlayer`] preloaded with `queue`
pub struct LocalConnector {
    queue: Vec<MediaItem>,
    delay: Duration,
}

impl LocalConnector {
    pub fn new(queue: Vec<MediaItem>) -> Self {
        Self {
            queue,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SessionConnector for LocalConnector {
    type Controller = LocalPlayer;

    async fn connect(
        &self,
        descriptor: SessionDescriptor,
        link: SessionLink<LocalPlayer>,
    ) -> Result<Arc<LocalPlayer>, BindingError> {
        if descriptor.component.is_empty() {
            return Err(BindingError::SessionUnavailable(
                "empty component name".to_string(),
            ));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let player = LocalPlayer::with_queue(self.queue.clone(), 0);
        player.attach_link(link);
        info!(
            "Local session {} ready with {} items",
            descriptor.component,
            self.queue.len()
        );
        Ok(Arc::new(player))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<PlayerEvent>>);

    impl PlayerListener for Recorder {
        fn on_event(&self, event: &PlayerEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn listeners_see_transport_changes() {
        let player = LocalPlayer::with_queue(vec![MediaItem::new("a")], 0);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let id = player.add_listener(recorder.clone());

        player.play();
        assert_eq!(
            *recorder.0.lock(),
            vec![
                PlayerEvent::PlayWhenReadyChanged(true),
                PlayerEvent::PlaybackStateChanged(PlaybackState::Ready),
            ]
        );

        assert!(player.remove_listener(id));
        player.stop();
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn connector_rejects_empty_component() {
        use crate::session::binding::{ControllerBinding, SessionEvent};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut binding = ControllerBinding::new(
            Arc::new(LocalConnector::new(Vec::new())),
            SessionDescriptor {
                component: String::new(),
                token: "t".into(),
            },
            tx,
        );
        binding.start();

        match rx.recv().await {
            Some(SessionEvent::Resolved {
                token,
                lifecycle,
                result,
            }) => {
                assert!(matches!(result, Err(BindingError::SessionUnavailable(_))));
                binding.on_resolved(token, lifecycle, result);
            }
            _ => panic!("expected a resolution"),
        }
        assert!(binding.get().is_none());
        assert!(binding.current_token().is_none());
    }

    #[tokio::test]
    async fn disconnect_reaches_the_binding() {
        use crate::session::binding::{ControllerBinding, SessionEvent};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut binding = ControllerBinding::new(
            Arc::new(LocalConnector::new(vec![MediaItem::new("a")])),
            SessionDescriptor {
                component: "local".into(),
                token: "t".into(),
            },
            tx,
        );
        binding.start();
        if let Some(SessionEvent::Resolved {
            token,
            lifecycle,
            result,
        }) = rx.recv().await
        {
            binding.on_resolved(token, lifecycle, result);
        }
        let player = binding.get().expect("connected");

        assert!(player.disconnect());
        match rx.recv().await {
            Some(SessionEvent::Disconnected { token }) => binding.on_disconnected(token),
            _ => panic!("expected a disconnect"),
        }
        assert!(binding.get().is_none());
    }
}
