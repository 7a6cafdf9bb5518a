//! Custom command routing
//!
//! Handlers are tried in registration order. A handler that answers
//! [`SessionResult::NotSupported`] synchronously passes the command on; any
//! other answer, or a future that is not ready yet, ends the chain.

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use super::registry::{CallbackId, ListenerRegistry};
use crate::lifecycle::Lifecycle;

/// Argument bundle attached to a command or a result
pub type CommandArgs = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCommand {
    pub action: String,
}

impl SessionCommand {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionResult {
    Success {
        #[serde(default)]
        extras: CommandArgs,
    },
    NotSupported,
    Error(String),
}

impl SessionResult {
    pub fn success() -> Self {
        SessionResult::Success {
            extras: CommandArgs::new(),
        }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, SessionResult::NotSupported)
    }
}

pub type CommandFuture = BoxFuture<'static, SessionResult>;

/// `(controller, command, args) -> eventual result`
pub type CommandHandler<C> =
    dyn Fn(&Arc<C>, &SessionCommand, &CommandArgs) -> CommandFuture + Send + Sync;

/// Outcome of routing one command
pub enum Dispatched {
    /// A handler answered synchronously
    Ready(SessionResult),
    /// A handler accepted the command and will answer later
    Pending(CommandFuture),
}

impl Dispatched {
    /// Waits for the final result
    pub async fn resolve(self) -> SessionResult {
        match self {
            Dispatched::Ready(result) => result,
            Dispatched::Pending(future) => future.await,
        }
    }
}

pub struct CommandDispatcher<C> {
    handlers: ListenerRegistry<CommandHandler<C>>,
}

impl<C: Send + Sync + 'static> CommandDispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: ListenerRegistry::new(),
        }
    }

    /// Appends a handler, optionally bounded by `lifecycle`
    pub fn add_handler(
        &self,
        lifecycle: Option<&Lifecycle>,
        handler: Arc<CommandHandler<C>>,
    ) -> Option<CallbackId> {
        self.handlers.add_callback(lifecycle, handler)
    }

    /// Routes `command` through the handler chain
    ///
    /// Each handler is asked at most once per call, so the chain always ends.
    /// Exhausting it, or having no handlers, answers `NotSupported`.
    pub fn dispatch(
        &self,
        controller: &Arc<C>,
        command: &SessionCommand,
        args: &CommandArgs,
    ) -> Dispatched {
        for (index, handler) in self.handlers.callbacks().into_iter().enumerate() {
            let mut future = handler(controller, command, args);
            match (&mut future).now_or_never() {
                Some(SessionResult::NotSupported) => {
                    trace!("Handler {} passed on {}", index, command.action);
                }
                Some(result) => {
                    debug!("Handler {} answered {}", index, command.action);
                    return Dispatched::Ready(result);
                }
                None => {
                    debug!("Handler {} accepted {} asynchronously", index, command.action);
                    return Dispatched::Pending(future);
                }
            }
        }

        debug!("No handler for custom command {}", command.action);
        Dispatched::Ready(SessionResult::NotSupported)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn release(&self) {
        self.handlers.release();
    }
}

impl<C: Send + Sync + 'static> Default for CommandDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
