//! Remote playback session plumbing
//!
//! A [`ControllerBinding`] acquires the remote [`PlayerController`] and ties
//! its validity to a binding [`Lifecycle`](crate::lifecycle::Lifecycle).
//! Connection listeners live in a [`ListenerRegistry`], custom commands are
//! routed by a [`CommandDispatcher`] and queue edits go through a
//! [`QueueMutator`]. [`PlaybackClient`] runs all of it on one control task.

pub mod binding;
pub mod client;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod queue;
pub mod registry;

pub use binding::{
    AttemptToken, ConnectionCallback, ControllerBinding, ListenerFactory, SessionConnector,
    SessionDescriptor, SessionEvent, SessionLink,
};
pub use client::{ClientRequest, PlaybackClient, PlaybackClientHandle};
pub use controller::{
    ListenerId, MediaItem, PlaybackState, PlayerController, PlayerEvent, PlayerListener,
};
pub use dispatcher::{
    CommandArgs, CommandDispatcher, CommandFuture, CommandHandler, Dispatched, SessionCommand,
    SessionResult,
};
pub use error::{BindingError, ClientError};
pub use local::{LocalConnector, LocalPlayer};
pub use queue::{QueueMutator, QueueSnapshot, RemovalOutcome};
pub use registry::{CallbackId, Disposable, ListenerRegistry};
