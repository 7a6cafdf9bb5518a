//! Playback Client - control task owning the controller binding
//!
//! Everything that touches the connected controller runs here: acquisition
//! continuations, connection listener dispatch, custom command routing and
//! queue edits. Other tasks talk to it through a [`PlaybackClientHandle`].
//!
//! ```text
//! owner Lifecycle ──(observer)──┐
//! SessionConnector ──(SessionEvent)──┼──► PlaybackClient::run ──► PlayerController
//! PlaybackClientHandle ──(ClientRequest)──┘
//! ```
//!
//! The owner lifecycle drives the binding: reaching `Started` connects,
//! falling back below it disconnects, `Destroyed` tears everything down and
//! ends the task. Pending custom command replies are polled by the same task.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::binding::{
    AttemptToken, ConnectionCallback, ControllerBinding, ListenerFactory, SessionConnector,
    SessionDescriptor, SessionEvent,
};
use super::dispatcher::{
    CommandArgs, CommandDispatcher, CommandHandler, Dispatched, SessionCommand, SessionResult,
};
use super::error::ClientError;
use super::queue::{QueueMutator, RemovalOutcome};
use super::registry::CallbackId;
use crate::lifecycle::{Lifecycle, LifecycleState};

const REQUEST_BUFFER: usize = 32;

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            warn!("Requester went away before the response was sent");
        }
    };
}

pub enum ClientRequest<C> {
    Controller {
        response_tx: oneshot::Sender<Option<Arc<C>>>,
    },
    RemoveMediaItem {
        media_id: String,
        response_tx: oneshot::Sender<Option<RemovalOutcome>>,
    },
    AddControllerCallback {
        lifecycle: Option<Lifecycle>,
        callback: Arc<ConnectionCallback<C>>,
        response_tx: oneshot::Sender<Option<CallbackId>>,
    },
    AddPlayerListener {
        lifecycle: Lifecycle,
        factory: Arc<ListenerFactory<C>>,
        response_tx: oneshot::Sender<Option<CallbackId>>,
    },
    AddCommandHandler {
        lifecycle: Option<Lifecycle>,
        handler: Arc<CommandHandler<C>>,
        response_tx: oneshot::Sender<Option<CallbackId>>,
    },
}

pub struct PlaybackClient<K: SessionConnector> {
    binding: ControllerBinding<K>,
    commands: CommandDispatcher<K::Controller>,
    events: mpsc::UnboundedReceiver<SessionEvent<K::Controller>>,
    pending: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl<K: SessionConnector> PlaybackClient<K> {
    pub fn new(connector: Arc<K>, descriptor: SessionDescriptor) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            binding: ControllerBinding::new(connector, descriptor, events_tx),
            commands: CommandDispatcher::new(),
            events,
            pending: FuturesUnordered::new(),
        }
    }

    pub fn binding(&self) -> &ControllerBinding<K> {
        &self.binding
    }

    pub fn binding_mut(&mut self) -> &mut ControllerBinding<K> {
        &mut self.binding
    }

    pub fn commands(&self) -> &CommandDispatcher<K::Controller> {
        &self.commands
    }

    /// Custom command replies still waiting on a handler future
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Follows the owner lifecycle; returns `false` once the owner is gone
    pub fn on_owner_state(&mut self, state: LifecycleState) -> bool {
        match state {
            LifecycleState::Started | LifecycleState::Resumed => {
                if self.binding.current_token().is_none() {
                    self.binding.start();
                }
                true
            }
            LifecycleState::Destroyed => {
                self.shutdown();
                false
            }
            _ => {
                if self.binding.current_token().is_some() {
                    self.binding.stop();
                }
                true
            }
        }
    }

    pub fn handle_session_event(&mut self, event: SessionEvent<K::Controller>) {
        match event {
            SessionEvent::Resolved {
                token,
                lifecycle,
                result,
            } => self.binding.on_resolved(token, lifecycle, result),
            SessionEvent::Disconnected { token } => self.binding.on_disconnected(token),
            SessionEvent::CustomCommand {
                token,
                command,
                args,
                reply,
            } => self.on_custom_command(token, command, args, reply),
        }
    }

    fn on_custom_command(
        &mut self,
        token: AttemptToken,
        command: SessionCommand,
        args: CommandArgs,
        reply: oneshot::Sender<SessionResult>,
    ) {
        let controller = self
            .binding
            .get()
            .filter(|_| self.binding.current_token() == Some(token));
        let Some(controller) = controller else {
            debug!("Custom command {} for inactive session", command.action);
            respond!(
                reply,
                SessionResult::Error("session not connected".to_string())
            );
            return;
        };

        match self.commands.dispatch(&controller, &command, &args) {
            Dispatched::Ready(result) => respond!(reply, result),
            Dispatched::Pending(future) => {
                debug!("Custom command {} is still pending", command.action);
                self.pending.push(
                    async move {
                        let result = future.await;
                        respond!(reply, result);
                    }
                    .boxed(),
                );
            }
        }
    }

    pub fn handle_request(&mut self, request: ClientRequest<K::Controller>) {
        match request {
            ClientRequest::Controller { response_tx } => {
                respond!(response_tx, self.binding.get());
            }
            ClientRequest::RemoveMediaItem {
                media_id,
                response_tx,
            } => {
                let outcome = self
                    .binding
                    .get()
                    .map(|controller| QueueMutator::new(controller.as_ref()).remove_item(&media_id));
                if outcome.is_none() {
                    debug!("Cannot remove {} without a controller", media_id);
                }
                respond!(response_tx, outcome);
            }
            ClientRequest::AddControllerCallback {
                lifecycle,
                callback,
                response_tx,
            } => {
                let id = self
                    .binding
                    .add_controller_callback(lifecycle.as_ref(), callback);
                respond!(response_tx, id);
            }
            ClientRequest::AddPlayerListener {
                lifecycle,
                factory,
                response_tx,
            } => {
                let id = self.binding.add_player_listener(&lifecycle, factory);
                respond!(response_tx, id);
            }
            ClientRequest::AddCommandHandler {
                lifecycle,
                handler,
                response_tx,
            } => {
                let id = self.commands.add_handler(lifecycle.as_ref(), handler);
                respond!(response_tx, id);
            }
        }
    }

    /// Drives the client until the owner is destroyed, `shutdown` fires, or
    /// every handle is dropped
    pub async fn run(
        mut self,
        owner: Lifecycle,
        mut requests: mpsc::Receiver<ClientRequest<K::Controller>>,
        shutdown: CancellationToken,
    ) {
        // every transition is queued; a stop followed by a start must not collapse
        let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();
        let observer = owner.observe(move |state| {
            let _ = owner_tx.send(state);
        });
        let initial = owner.state();
        info!("Playback client running, owner is {}", initial);
        if !self.on_owner_state(initial) {
            owner.remove_observer(observer);
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Playback client shutdown requested");
                    break;
                }
                state = owner_rx.recv() => {
                    let Some(state) = state else {
                        warn!("Owner lifecycle stopped reporting");
                        break;
                    };
                    debug!("Owner moved to {}", state);
                    if !self.on_owner_state(state) {
                        info!("Owner destroyed, playback client exiting");
                        return;
                    }
                }
                Some(event) = self.events.recv() => self.handle_session_event(event),
                Some(()) = self.pending.next(), if !self.pending.is_empty() => {}
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("All client handles dropped");
                        break;
                    }
                },
            }
        }

        owner.remove_observer(observer);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.binding.stop();
        self.binding.release_listeners();
        self.commands.release();
        if !self.pending.is_empty() {
            debug!("Dropping {} pending custom command replies", self.pending.len());
            self.pending = FuturesUnordered::new();
        }
        info!("Playback client released");
    }
}

/// Cloneable front of a running [`PlaybackClient`]
pub struct PlaybackClientHandle<C> {
    tx: mpsc::Sender<ClientRequest<C>>,
}

impl<C> Clone for PlaybackClientHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> PlaybackClientHandle<C> {
    /// Spawns the control task for `connector`, bound to `owner`
    pub fn spawn<K>(
        connector: Arc<K>,
        descriptor: SessionDescriptor,
        owner: Lifecycle,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>)
    where
        K: SessionConnector<Controller = C>,
    {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let client = PlaybackClient::new(connector, descriptor);
        let task = tokio::spawn(client.run(owner, rx, shutdown));
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ClientRequest<C>,
    ) -> Result<T, ClientError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|e| ClientError::ChannelClosed(e.to_string()))?;
        response_rx
            .await
            .map_err(|e| ClientError::ChannelClosed(e.to_string()))
    }

    /// The connected controller, `None` while not connected
    pub async fn controller(&self) -> Result<Option<Arc<C>>, ClientError> {
        self.request(|response_tx| ClientRequest::Controller { response_tx })
            .await
    }

    /// Removes `media_id` from the queue; `None` while not connected
    pub async fn remove_media_item(
        &self,
        media_id: impl Into<String>,
    ) -> Result<Option<RemovalOutcome>, ClientError> {
        let media_id = media_id.into();
        self.request(|response_tx| ClientRequest::RemoveMediaItem {
            media_id,
            response_tx,
        })
        .await
    }

    pub async fn add_controller_callback(
        &self,
        lifecycle: Option<Lifecycle>,
        callback: Arc<ConnectionCallback<C>>,
    ) -> Result<Option<CallbackId>, ClientError> {
        self.request(|response_tx| ClientRequest::AddControllerCallback {
            lifecycle,
            callback,
            response_tx,
        })
        .await
    }

    pub async fn add_player_listener(
        &self,
        lifecycle: Lifecycle,
        factory: Arc<ListenerFactory<C>>,
    ) -> Result<Option<CallbackId>, ClientError> {
        self.request(|response_tx| ClientRequest::AddPlayerListener {
            lifecycle,
            factory,
            response_tx,
        })
        .await
    }

    pub async fn add_command_handler(
        &self,
        lifecycle: Option<Lifecycle>,
        handler: Arc<CommandHandler<C>>,
    ) -> Result<Option<CallbackId>, ClientError> {
        self.request(|response_tx| ClientRequest::AddCommandHandler {
            lifecycle,
            handler,
            response_tx,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::controller::{MediaItem, PlayerController};
    use crate::session::local::{LocalConnector, LocalPlayer};
    use crate::session::registry::Disposable;
    use futures_util::FutureExt;
    use parking_lot::Mutex;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            component: "local".into(),
            token: "test".into(),
        }
    }

    fn spawn_client(
        owner: &Lifecycle,
    ) -> (PlaybackClientHandle<LocalPlayer>, JoinHandle<()>) {
        let connector = LocalConnector::new(vec![
            MediaItem::new("a"),
            MediaItem::new("b"),
            MediaItem::new("c"),
        ]);
        PlaybackClientHandle::spawn(
            Arc::new(connector),
            descriptor(),
            owner.clone(),
            CancellationToken::new(),
        )
    }

    async fn connected(handle: &PlaybackClientHandle<LocalPlayer>) -> Arc<LocalPlayer> {
        loop {
            if let Some(controller) = handle.controller().await.unwrap() {
                return controller;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connects_once_owner_starts() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Created);
        let (handle, _task) = spawn_client(&owner);

        assert!(handle.controller().await.unwrap().is_none());
        owner.set_state(LifecycleState::Started);
        let player = connected(&handle).await;
        assert_eq!(player.media_item_count(), 3);
    }

    #[tokio::test]
    async fn owner_stop_releases_the_controller() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let (handle, _task) = spawn_client(&owner);
        let player = connected(&handle).await;

        owner.set_state(LifecycleState::Created);
        while handle.controller().await.unwrap().is_some() {
            tokio::task::yield_now().await;
        }
        assert_eq!(player.release_count(), 1);
    }

    #[tokio::test]
    async fn back_to_back_stop_and_start_rebinds() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let (handle, _task) = spawn_client(&owner);
        let first = connected(&handle).await;

        owner.set_state(LifecycleState::Created);
        owner.set_state(LifecycleState::Started);
        let second = loop {
            let controller = connected(&handle).await;
            if !Arc::ptr_eq(&controller, &first) {
                break controller;
            }
            tokio::task::yield_now().await;
        };

        assert_eq!(first.release_count(), 1);
        assert!(!second.is_released());
        assert_eq!(owner.observer_count(), 1);
    }

    #[tokio::test]
    async fn owner_destroy_ends_the_task() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Resumed);
        let (handle, task) = spawn_client(&owner);
        let player = connected(&handle).await;

        owner.destroy();
        task.await.unwrap();
        assert!(player.is_released());
        assert!(handle.controller().await.is_err());
    }

    #[tokio::test]
    async fn removal_goes_through_the_control_task() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Created);
        let (handle, _task) = spawn_client(&owner);
        assert_eq!(handle.remove_media_item("a").await.unwrap(), None);

        owner.set_state(LifecycleState::Started);
        let player = connected(&handle).await;
        let outcome = handle.remove_media_item("a").await.unwrap();
        assert_eq!(
            outcome,
            Some(RemovalOutcome::ReplacedCurrent {
                index: 0,
                resumed: false
            })
        );
        assert_eq!(player.current_media_item().unwrap().media_id, "b");
    }

    #[tokio::test]
    async fn callbacks_see_every_connection() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let (handle, _task) = spawn_client(&owner);
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        handle
            .add_controller_callback(
                Some(owner.clone()),
                Arc::new(move |_: &mut Disposable, _: &Arc<LocalPlayer>, _: &Lifecycle| {
                    *counter.lock() += 1;
                }),
            )
            .await
            .unwrap();
        connected(&handle).await;
        assert_eq!(*seen.lock(), 1);

        owner.set_state(LifecycleState::Created);
        while handle.controller().await.unwrap().is_some() {
            tokio::task::yield_now().await;
        }
        owner.set_state(LifecycleState::Started);
        while *seen.lock() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock(), 2);
    }

    #[tokio::test]
    async fn custom_commands_reach_handlers() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let (handle, _task) = spawn_client(&owner);
        handle
            .add_command_handler(
                None,
                Arc::new(
                    |controller: &Arc<LocalPlayer>, command: &SessionCommand, _: &CommandArgs| {
                        let result = if command.action == "count" {
                            let mut extras = CommandArgs::new();
                            extras.insert(
                                "count".into(),
                                serde_json::json!(controller.media_item_count()),
                            );
                            SessionResult::Success { extras }
                        } else {
                            SessionResult::NotSupported
                        };
                        async move { result }.boxed()
                    },
                ),
            )
            .await
            .unwrap();

        let player = connected(&handle).await;
        let link = player.link().unwrap();

        let result = link
            .send_custom_command(SessionCommand::new("count"), CommandArgs::new())
            .await
            .unwrap();
        let mut extras = CommandArgs::new();
        extras.insert("count".into(), serde_json::json!(3));
        assert_eq!(result, SessionResult::Success { extras });

        let result = link
            .send_custom_command(SessionCommand::new("unknown"), CommandArgs::new())
            .await
            .unwrap();
        assert_eq!(result, SessionResult::NotSupported);
    }

    #[tokio::test]
    async fn deferred_handler_reply_arrives() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let (handle, _task) = spawn_client(&owner);
        handle
            .add_command_handler(
                None,
                Arc::new(|_: &Arc<LocalPlayer>, _: &SessionCommand, _: &CommandArgs| {
                    async {
                        // not ready on the first poll
                        tokio::task::yield_now().await;
                        SessionResult::success()
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let player = connected(&handle).await;
        let result = player
            .link()
            .unwrap()
            .send_custom_command(SessionCommand::new("later"), CommandArgs::new())
            .await
            .unwrap();
        assert_eq!(result, SessionResult::success());
    }

    #[tokio::test]
    async fn deferred_handler_is_polled_by_the_client() {
        let mut client = PlaybackClient::new(
            Arc::new(LocalConnector::new(vec![MediaItem::new("a")])),
            descriptor(),
        );
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));
        client.commands.add_handler(
            None,
            Arc::new(move |_: &Arc<LocalPlayer>, _: &SessionCommand, _: &CommandArgs| {
                let gate = gate.lock().take();
                async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    SessionResult::success()
                }
                .boxed()
            }),
        );

        let token = client.binding_mut().start();
        let resolved = client.events.recv().await.unwrap();
        client.handle_session_event(resolved);
        assert!(client.binding().get().is_some());

        let (reply_tx, mut reply_rx) = oneshot::channel();
        client.handle_session_event(SessionEvent::CustomCommand {
            token,
            command: SessionCommand::new("gated"),
            args: CommandArgs::new(),
            reply: reply_tx,
        });
        assert_eq!(client.pending_commands(), 1);
        assert!(reply_rx.try_recv().is_err());

        gate_tx.send(()).unwrap();
        client.pending.next().await;
        assert_eq!(client.pending_commands(), 0);
        assert_eq!(reply_rx.await.unwrap(), SessionResult::success());
    }

    #[tokio::test]
    async fn shutdown_token_stops_the_client() {
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Started);
        let shutdown = CancellationToken::new();
        let (handle, task) = PlaybackClientHandle::spawn(
            Arc::new(LocalConnector::new(vec![MediaItem::new("a")])),
            descriptor(),
            owner.clone(),
            shutdown.clone(),
        );
        let player = connected(&handle).await;

        shutdown.cancel();
        task.await.unwrap();
        assert!(player.is_released());
    }
}
