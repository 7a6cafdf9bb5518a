//! Lifecycle primitives
//!
//! A [`Lifecycle`] is the usage window of a resource: the UI scope that owns a
//! playback client, or the binding to one remote controller. Features that must
//! not outlive either of two windows observe a [`LifecycleIntersection`].
//!
//! # State order
//!
//! ```text
//! Uninitialized < Initialized < Created < Started < Resumed < Destroyed
//! ```
//!
//! `Destroyed` is terminal and only reachable after `Created`.

pub mod intersection;
pub mod state;

pub use intersection::LifecycleIntersection;
pub use state::{Lifecycle, LifecycleState, ObserverId, WeakLifecycle};
