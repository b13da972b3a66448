//! Loads keyed resources into display slots.
//!
//! The [`Coordinator`] serves requests from a weight-bounded LRU [`CacheStore`] and falls back to
//! running the [`Loader`] in the background. It coalesces repeated requests for the same slot and
//! key, and cancels loads that a slot no longer wants.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod loader;
pub mod logging;
pub mod slots;
pub mod tasks;

pub use caching::{CacheStore, Cached};
pub use coordinator::{Coordinator, CoordinatorBuilder, RequestError, RequestOutcome};
pub use loader::{LoadError, Loader};
pub use slots::{SlotContent, SlotId};
pub use tasks::{LoadTask, TaskId, TaskState};
