//! Lifetime-scoped binding to a remote playback controller.
//!
//! The crate is organised leaf-first:
//!
//! 1. [`lifecycle`] - ordered, observable lifecycles and their intersection
//! 2. [`session`] - controller acquisition, listener registries, command dispatch
//!    and queue edits, driven by a single control task
//! 3. [`download`] and [`realtime`] - collaborators at the I/O boundary
//!
//! ```text
//! SessionConnector ──► ControllerBinding ──► connection listeners
//!                           │                      │
//!                     binding Lifecycle ──► LifecycleIntersection ──► player listeners
//! ```

pub mod config;
pub mod download;
pub mod lifecycle;
pub mod realtime;
pub mod session;
