//! Units of background work that load a single resource for a slot.
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::slots::SlotId;

/// Identifies a [`LoadTask`] for the lifetime of its coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Hands out increasing task ids.
    pub(crate) fn next(counter: &AtomicU64) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The lifecycle of a [`LoadTask`].
///
/// ```text
/// Pending --begin--> Running --complete--> Completed
///    |                  |
///    +-----cancel-------+----------------> Cancelled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created, but the loader was not invoked yet.
    Pending = 0,
    /// The loader is running, or its result waits to be processed.
    Running = 1,
    /// The result was processed.
    Completed = 2,
    /// The task was cancelled before it completed, its result is discarded.
    Cancelled = 3,
}

impl TaskState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::Cancelled,
        }
    }
}

/// A single load of a resource, bound to the slot that requested it.
///
/// The task is shared between the coordinator, which binds it to a slot, and the worker thread that
/// runs the loader. It refers to its slot only by [`SlotId`], so it neither keeps the slot alive nor
/// notices when the slot is destroyed until its completion is processed.
pub struct LoadTask<K> {
    id: TaskId,
    slot: SlotId,
    key: OnceLock<K>,
    state: AtomicU8,
}

impl<K> LoadTask<K> {
    pub(crate) fn new(id: TaskId, slot: SlotId) -> Self {
        Self {
            id,
            slot,
            key: OnceLock::new(),
            state: AtomicU8::new(TaskState::Pending as u8),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The slot this task was created for.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The key being loaded, [`None`] until the task is scheduled.
    pub fn key(&self) -> Option<&K> {
        self.key.get()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Assigns the key right before the task is handed to a worker.
    ///
    /// Returns `false` if the task already had a key.
    pub(crate) fn assign_key(&self, key: K) -> bool {
        self.key.set(key).is_ok()
    }

    /// Requests cancellation.
    ///
    /// A running loader is not interrupted, but its result will be discarded. Returns `true` if
    /// this call moved the task into [`TaskState::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.transition(|state| match state {
            TaskState::Pending | TaskState::Running => Some(TaskState::Cancelled),
            TaskState::Completed | TaskState::Cancelled => None,
        })
    }

    /// Marks the loader as started. Fails if the task was cancelled in the meantime.
    pub(crate) fn begin(&self) -> bool {
        self.transition(|state| (state == TaskState::Pending).then_some(TaskState::Running))
    }

    /// Marks the result as processed. A cancelled task stays cancelled.
    pub(crate) fn complete(&self) -> bool {
        self.transition(|state| (state == TaskState::Running).then_some(TaskState::Completed))
    }

    fn transition(&self, f: impl Fn(TaskState) -> Option<TaskState>) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                f(TaskState::from_u8(state)).map(|state| state as u8)
            })
            .is_ok()
    }
}

impl<K: PartialEq> LoadTask<K> {
    /// Whether this task loads `key`.
    ///
    /// A task without a key yet never matches.
    pub fn is_loading(&self, key: &K) -> bool {
        self.key().is_some_and(|own| own == key)
    }
}

impl<K: fmt::Debug> fmt::Debug for LoadTask<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTask")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}
