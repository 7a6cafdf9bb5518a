//! Controller Binding - asynchronous acquisition of the remote controller
//!
//! Owns at most one acquisition attempt at a time together with the binding
//! lifecycle that represents it. Attempts are identified by an
//! [`AttemptToken`]; completions come back to the control task as
//! [`SessionEvent`]s and are only published when their token is still the
//! current one.
//!
//! # Attempt states
//!
//! ```text
//! start() ──► Pending ──(Resolved, token current)──► Connected ──stop()──► released
//!                │                                       │
//!                ├──(Resolved, token stale)──► released  └──(Disconnected)──► cleared
//!                └──stop() / start()──► cancelled
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{register_lifecycle_listener, PlayerController, PlayerListener};
use super::dispatcher::{CommandArgs, SessionCommand, SessionResult};
use super::error::BindingError;
use super::registry::{CallbackId, Disposable, ListenerRegistry};
use crate::lifecycle::{Lifecycle, LifecycleIntersection, LifecycleState};

/// Stable description of the remote session to bind to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Component name of the playback service
    pub component: String,
    /// Identifying token handed out by the service
    pub token: String,
}

/// Identity of one acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptToken(u64);

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything that reaches the control task from outside it
pub enum SessionEvent<C> {
    /// An acquisition attempt finished
    Resolved {
        token: AttemptToken,
        lifecycle: Lifecycle,
        result: Result<Arc<C>, BindingError>,
    },
    /// The remote session went away
    Disconnected { token: AttemptToken },
    /// The remote session sent a custom command
    CustomCommand {
        token: AttemptToken,
        command: SessionCommand,
        args: CommandArgs,
        reply: oneshot::Sender<SessionResult>,
    },
}

/// Back channel from a remote session to the control task of one attempt
pub struct SessionLink<C> {
    token: AttemptToken,
    events: mpsc::UnboundedSender<SessionEvent<C>>,
}

impl<C> Clone for SessionLink<C> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            events: self.events.clone(),
        }
    }
}

impl<C> SessionLink<C> {
    pub fn token(&self) -> AttemptToken {
        self.token
    }

    /// Signals that the session ended; returns `false` if nobody listens anymore
    pub fn notify_disconnected(&self) -> bool {
        self.events
            .send(SessionEvent::Disconnected { token: self.token })
            .is_ok()
    }

    /// Delivers a custom command; the receiver resolves with the handler result
    pub fn send_custom_command(
        &self,
        command: SessionCommand,
        args: CommandArgs,
    ) -> oneshot::Receiver<SessionResult> {
        let (reply, response) = oneshot::channel();
        let event = SessionEvent::CustomCommand {
            token: self.token,
            command,
            args,
            reply,
        };
        if self.events.send(event).is_err() {
            warn!("Control task gone, custom command dropped");
        }
        response
    }
}

/// Discovery side of a remote playback session
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Controller: PlayerController;

    /// Connects to the session described by `descriptor`
    ///
    /// `link` stays valid for the lifetime of the returned controller and is
    /// how the session reports disconnection or custom commands later.
    async fn connect(
        &self,
        descriptor: SessionDescriptor,
        link: SessionLink<Self::Controller>,
    ) -> Result<Arc<Self::Controller>, BindingError>;
}

/// Connection listener: `(disposable, controller, binding lifecycle)`
pub type ConnectionCallback<C> = dyn Fn(&mut Disposable, &Arc<C>, &Lifecycle) + Send + Sync;

/// Builds a fresh player listener for every connection
pub type ListenerFactory<C> = dyn Fn(&Arc<C>) -> Arc<dyn PlayerListener> + Send + Sync;

struct Acquisition<C> {
    token: AttemptToken,
    lifecycle: Lifecycle,
    cancel: CancellationToken,
    controller: Option<Arc<C>>,
}

pub struct ControllerBinding<K: SessionConnector> {
    connector: Arc<K>,
    descriptor: SessionDescriptor,
    events: mpsc::UnboundedSender<SessionEvent<K::Controller>>,
    next_token: u64,
    acquisition: Option<Acquisition<K::Controller>>,
    connection_listeners: ListenerRegistry<ConnectionCallback<K::Controller>>,
}

impl<K: SessionConnector> ControllerBinding<K> {
    pub fn new(
        connector: Arc<K>,
        descriptor: SessionDescriptor,
        events: mpsc::UnboundedSender<SessionEvent<K::Controller>>,
    ) -> Self {
        Self {
            connector,
            descriptor,
            events,
            next_token: 0,
            acquisition: None,
            connection_listeners: ListenerRegistry::new(),
        }
    }

    /// Starts a new acquisition and returns without waiting for it
    ///
    /// Any outstanding attempt is invalidated first. Must be called from
    /// within a tokio runtime.
    pub fn start(&mut self) -> AttemptToken {
        if let Some(previous) = self.acquisition.take() {
            debug!("Attempt {} superseded", previous.token);
            Self::teardown(previous);
        }

        self.next_token += 1;
        let token = AttemptToken(self.next_token);
        let lifecycle = Lifecycle::new();
        let cancel = CancellationToken::new();

        let connector = self.connector.clone();
        let descriptor = self.descriptor.clone();
        let events = self.events.clone();
        let link = SessionLink {
            token,
            events: events.clone(),
        };
        let attempt_lifecycle = lifecycle.clone();
        let attempt_cancel = cancel.clone();

        info!(
            "Connecting to session {} (attempt {})",
            descriptor.component, token
        );
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = attempt_cancel.cancelled() => {
                    debug!("Attempt {} cancelled before resolving", token);
                    return;
                }
                result = connector.connect(descriptor, link) => result,
            };
            let resolved = SessionEvent::Resolved {
                token,
                lifecycle: attempt_lifecycle,
                result,
            };
            if let Err(mpsc::error::SendError(SessionEvent::Resolved {
                result: Ok(controller),
                ..
            })) = events.send(resolved)
            {
                warn!("Control task gone before attempt {} resolved", token);
                controller.release();
            }
        });

        self.acquisition = Some(Acquisition {
            token,
            lifecycle,
            cancel,
            controller: None,
        });
        token
    }

    /// The connected controller, if the current attempt resolved
    pub fn get(&self) -> Option<Arc<K::Controller>> {
        self.acquisition
            .as_ref()
            .and_then(|acquisition| acquisition.controller.clone())
    }

    /// Lifecycle of the current attempt; `Created` once connected
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.acquisition
            .as_ref()
            .map(|acquisition| acquisition.lifecycle.clone())
    }

    pub fn current_token(&self) -> Option<AttemptToken> {
        self.acquisition.as_ref().map(|acquisition| acquisition.token)
    }

    pub fn is_pending(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(|acquisition| acquisition.controller.is_none())
    }

    /// Completion continuation of an attempt
    pub fn on_resolved(
        &mut self,
        token: AttemptToken,
        lifecycle: Lifecycle,
        result: Result<Arc<K::Controller>, BindingError>,
    ) {
        let current = self
            .acquisition
            .as_mut()
            .filter(|acquisition| acquisition.token == token);

        let Some(acquisition) = current else {
            debug!("Discarding stale attempt {}", token);
            lifecycle.destroy();
            if let Ok(controller) = result {
                controller.release();
            }
            return;
        };

        match result {
            Ok(controller) => {
                acquisition.controller = Some(controller.clone());
                acquisition.lifecycle.set_state(LifecycleState::Created);
                let lifecycle = acquisition.lifecycle.clone();

                info!(
                    "Controller connected (attempt {}), notifying {} listeners",
                    token,
                    self.connection_listeners.len()
                );
                self.connection_listeners
                    .dispatch(|callback, disposable| callback(disposable, &controller, &lifecycle));
            }
            Err(e) => {
                warn!("Attempt {} failed: {}", token, e);
                self.acquisition = None;
            }
        }
    }

    /// Tears the binding down
    ///
    /// A connected controller is released; a pending attempt is cancelled and
    /// any late resolution of it will fail the token check.
    pub fn stop(&mut self) {
        match self.acquisition.take() {
            Some(acquisition) => {
                info!("Stopping binding (attempt {})", acquisition.token);
                Self::teardown(acquisition);
            }
            None => debug!("Stop without an active binding"),
        }
    }

    fn teardown(acquisition: Acquisition<K::Controller>) {
        match acquisition.controller {
            Some(controller) => {
                if acquisition.cancel.is_cancelled() {
                    panic!(
                        "controller acquisition {} is both resolved and cancelled",
                        acquisition.token
                    );
                }
                controller.release();
            }
            None => acquisition.cancel.cancel(),
        }
        acquisition.lifecycle.destroy();
    }

    /// The remote session reported that it is gone
    pub fn on_disconnected(&mut self, token: AttemptToken) {
        match self.acquisition.take() {
            Some(acquisition) if acquisition.token == token => {
                info!("Session disconnected (attempt {})", token);
                acquisition.cancel.cancel();
                acquisition.lifecycle.destroy();
            }
            other => {
                debug!("Ignoring disconnect of stale attempt {}", token);
                self.acquisition = other;
            }
        }
    }

    /// Registers a connection listener, replaying an existing connection
    ///
    /// If a controller is already connected the callback runs before this
    /// returns. A callback that disposes itself during that replay is not
    /// registered.
    pub fn add_controller_callback(
        &self,
        lifecycle: Option<&Lifecycle>,
        callback: Arc<ConnectionCallback<K::Controller>>,
    ) -> Option<CallbackId> {
        if lifecycle.is_some_and(|lifecycle| lifecycle.state().is_destroyed()) {
            debug!("Discarding controller callback for destroyed lifecycle");
            return None;
        }

        if let (Some(controller), Some(binding_lifecycle)) = (self.get(), self.lifecycle()) {
            let mut disposable = Disposable::default();
            callback(&mut disposable, &controller, &binding_lifecycle);
            if disposable.is_disposed() {
                debug!("Controller callback disposed during replay");
                return None;
            }
        }

        self.connection_listeners.add_callback(lifecycle, callback)
    }

    /// Attaches a listener from `factory` to every connected controller
    ///
    /// Each listener stays attached for as long as both `lifecycle` and the
    /// binding lifecycle of its connection are alive.
    pub fn add_player_listener(
        &self,
        lifecycle: &Lifecycle,
        factory: Arc<ListenerFactory<K::Controller>>,
    ) -> Option<CallbackId> {
        let owner = lifecycle.clone();
        self.add_controller_callback(
            Some(lifecycle),
            Arc::new(
                move |_: &mut Disposable, controller: &Arc<K::Controller>, binding: &Lifecycle| {
                    let bounded = LifecycleIntersection::new(&owner, binding);
                    register_lifecycle_listener(controller, bounded.lifecycle(), factory(controller));
                },
            ),
        )
    }

    pub fn connection_listener_count(&self) -> usize {
        self.connection_listeners.len()
    }

    /// Drops all connection listeners
    pub fn release_listeners(&self) {
        self.connection_listeners.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::local::LocalPlayer;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Connector whose attempts resolve only when the test says so
    #[derive(Default)]
    struct ScriptedConnector {
        pending: Mutex<VecDeque<oneshot::Sender<Result<Arc<LocalPlayer>, BindingError>>>>,
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        type Controller = LocalPlayer;

        async fn connect(
            &self,
            _descriptor: SessionDescriptor,
            _link: SessionLink<LocalPlayer>,
        ) -> Result<Arc<LocalPlayer>, BindingError> {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push_back(tx);
            rx.await
                .unwrap_or_else(|_| Err(BindingError::ConnectionFailed("dropped".into())))
        }
    }

    impl ScriptedConnector {
        async fn wait_for_attempts(&self, count: usize) {
            while self.pending.lock().len() < count {
                tokio::task::yield_now().await;
            }
        }

        fn resolve_next(&self, player: Arc<LocalPlayer>) {
            let tx = self.pending.lock().pop_front().expect("no pending attempt");
            let _ = tx.send(Ok(player));
        }
    }

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            component: "playback".into(),
            token: "local".into(),
        }
    }

    fn binding(
        connector: &Arc<ScriptedConnector>,
    ) -> (
        ControllerBinding<ScriptedConnector>,
        mpsc::UnboundedReceiver<SessionEvent<LocalPlayer>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ControllerBinding::new(connector.clone(), descriptor(), tx), rx)
    }

    async fn pump(
        binding: &mut ControllerBinding<ScriptedConnector>,
        rx: &mut mpsc::UnboundedReceiver<SessionEvent<LocalPlayer>>,
    ) {
        match rx.recv().await.expect("event channel closed") {
            SessionEvent::Resolved {
                token,
                lifecycle,
                result,
            } => binding.on_resolved(token, lifecycle, result),
            SessionEvent::Disconnected { token } => binding.on_disconnected(token),
            SessionEvent::CustomCommand { .. } => panic!("unexpected custom command"),
        }
    }

    fn counting_callback(
        calls: &Arc<Mutex<Vec<usize>>>,
    ) -> Arc<ConnectionCallback<LocalPlayer>> {
        let calls = calls.clone();
        Arc::new(
            move |_: &mut Disposable, controller: &Arc<LocalPlayer>, lifecycle: &Lifecycle| {
                assert_eq!(lifecycle.state(), LifecycleState::Created);
                calls.lock().push(controller.media_item_count());
            },
        )
    }

    #[tokio::test]
    async fn get_is_none_until_resolved() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);

        binding.start();
        assert!(binding.get().is_none());
        assert!(binding.is_pending());

        connector.wait_for_attempts(1).await;
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        pump(&mut binding, &mut rx).await;

        assert!(binding.get().is_some());
        assert_eq!(
            binding.lifecycle().map(|l| l.state()),
            Some(LifecycleState::Created)
        );
    }

    #[tokio::test]
    async fn only_latest_attempt_is_published() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        let calls = Arc::new(Mutex::new(Vec::new()));
        binding.add_controller_callback(None, counting_callback(&calls));

        binding.start();
        connector.wait_for_attempts(1).await;
        let first_lifecycle = binding.lifecycle().unwrap();
        // the first attempt's connector is still running while we restart
        let second_token = binding.start();
        connector.wait_for_attempts(2).await;

        let stale = Arc::new(LocalPlayer::new());
        let fresh = Arc::new(LocalPlayer::new());
        // the first attempt's task was cancelled and dropped its receiver, so
        // resolving its sender reaches nobody
        connector.resolve_next(stale.clone());
        connector.resolve_next(fresh.clone());
        pump(&mut binding, &mut rx).await;

        assert_eq!(binding.current_token(), Some(second_token));
        assert!(Arc::ptr_eq(&binding.get().unwrap(), &fresh));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(stale.release_count(), 0);
        assert_eq!(fresh.release_count(), 0);
        // never reached CREATED, so destroying it left it untouched
        assert_eq!(first_lifecycle.state(), LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn stale_resolution_is_released_exactly_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        let calls = Arc::new(Mutex::new(Vec::new()));
        binding.add_controller_callback(None, counting_callback(&calls));

        let first = binding.start();
        let first_lifecycle = binding.lifecycle().unwrap();
        let stale = Arc::new(LocalPlayer::new());
        // resolution raced ahead of the restart
        binding.on_resolved(first, first_lifecycle.clone(), Ok(stale.clone()));
        binding.start();
        assert_eq!(stale.release_count(), 1);

        // a late duplicate resolution of the old token is also discarded
        let duplicate = Arc::new(LocalPlayer::new());
        binding.on_resolved(first, first_lifecycle, Ok(duplicate.clone()));
        assert_eq!(duplicate.release_count(), 1);
        assert_eq!(stale.release_count(), 1);
        assert!(binding.get().is_none());

        // the first connector call is still parked; fail it and resolve the second
        connector.wait_for_attempts(2).await;
        connector.pending.lock().pop_front();
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        while binding.get().is_none() {
            pump(&mut binding, &mut rx).await;
        }
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn stop_releases_and_destroys() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        binding.start();
        connector.wait_for_attempts(1).await;
        let player = Arc::new(LocalPlayer::new());
        connector.resolve_next(player.clone());
        pump(&mut binding, &mut rx).await;
        let lifecycle = binding.lifecycle().unwrap();

        binding.stop();
        assert!(binding.get().is_none());
        assert_eq!(player.release_count(), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Destroyed);
    }

    #[tokio::test]
    async fn late_resolution_after_stop_is_released() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, _rx) = binding(&connector);
        let token = binding.start();
        let lifecycle = binding.lifecycle().unwrap();
        binding.stop();

        let late = Arc::new(LocalPlayer::new());
        binding.on_resolved(token, lifecycle.clone(), Ok(late.clone()));
        assert!(binding.get().is_none());
        assert_eq!(late.release_count(), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Initialized);
    }

    #[test]
    #[should_panic(expected = "both resolved and cancelled")]
    fn resolved_and_cancelled_attempt_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let acquisition = Acquisition {
            token: AttemptToken(1),
            lifecycle: Lifecycle::new(),
            cancel,
            controller: Some(Arc::new(LocalPlayer::new())),
        };
        ControllerBinding::<ScriptedConnector>::teardown(acquisition);
    }

    #[tokio::test]
    async fn late_listener_is_replayed_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        binding.start();
        connector.wait_for_attempts(1).await;
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        pump(&mut binding, &mut rx).await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        assert!(binding
            .add_controller_callback(None, counting_callback(&calls))
            .is_some());
        assert_eq!(calls.lock().len(), 1);

        // the next real connection reaches it once more, not twice
        binding.stop();
        binding.start();
        connector.wait_for_attempts(1).await;
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        pump(&mut binding, &mut rx).await;
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn listener_disposing_during_replay_is_not_kept() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        binding.start();
        connector.wait_for_attempts(1).await;
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        pump(&mut binding, &mut rx).await;

        let id = binding.add_controller_callback(
            None,
            Arc::new(|disposable: &mut Disposable, _: &Arc<LocalPlayer>, _: &Lifecycle| {
                disposable.dispose()
            }),
        );
        assert!(id.is_none());
        assert_eq!(binding.connection_listener_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_clears_current_binding_only() {
        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        let token = binding.start();
        connector.wait_for_attempts(1).await;
        connector.resolve_next(Arc::new(LocalPlayer::new()));
        pump(&mut binding, &mut rx).await;
        let lifecycle = binding.lifecycle().unwrap();

        binding.on_disconnected(AttemptToken(token.0 + 10));
        assert!(binding.get().is_some());

        binding.on_disconnected(token);
        assert!(binding.get().is_none());
        assert_eq!(lifecycle.state(), LifecycleState::Destroyed);
    }

    #[tokio::test]
    async fn player_listener_bounded_by_owner_and_binding() {
        struct Silent;
        impl PlayerListener for Silent {
            fn on_event(&self, _: &crate::session::controller::PlayerEvent) {}
        }

        let connector = Arc::new(ScriptedConnector::default());
        let (mut binding, mut rx) = binding(&connector);
        let owner = Lifecycle::new();
        owner.set_state(LifecycleState::Resumed);
        binding.add_player_listener(
            &owner,
            Arc::new(|_: &Arc<LocalPlayer>| Arc::new(Silent) as Arc<dyn PlayerListener>),
        );

        binding.start();
        connector.wait_for_attempts(1).await;
        let player = Arc::new(LocalPlayer::new());
        connector.resolve_next(player.clone());
        pump(&mut binding, &mut rx).await;
        assert_eq!(player.listener_count(), 1);

        owner.destroy();
        assert_eq!(player.listener_count(), 0);
    }
}
