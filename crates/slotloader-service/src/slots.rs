//! Display slots and their task bindings.
//!
//! A slot is the target a resource is requested for, such as an image view in a list. Slots live in
//! a [`SlotTable`] and are addressed by [`SlotId`]s, which are generational: once a slot is removed,
//! its id never resolves again, even if the table reuses the storage for a new slot. Load tasks keep
//! a [`SlotId`] instead of a reference, which is how a completion finds out that its slot is gone.
use std::fmt;
use std::sync::Arc;

use crate::tasks::{LoadTask, TaskId};

/// A handle to a slot in a [`SlotTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}v{}", self.index, self.generation)
    }
}

/// What a slot currently displays.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotContent<R> {
    /// Nothing was requested for this slot yet.
    Empty,
    /// A load is pending, or finished without a resource.
    Placeholder(Arc<R>),
    /// The loaded resource.
    Resource(Arc<R>),
}

impl<R> SlotContent<R> {
    pub fn resource(&self) -> Option<&Arc<R>> {
        match self {
            Self::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

impl<R> Clone for SlotContent<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Placeholder(placeholder) => Self::Placeholder(Arc::clone(placeholder)),
            Self::Resource(resource) => Self::Resource(Arc::clone(resource)),
        }
    }
}

/// A single slot: its content and the task currently bound to it.
pub struct Slot<K, R> {
    content: SlotContent<R>,
    current_task: Option<Arc<LoadTask<K>>>,
}

impl<K, R> Slot<K, R> {
    fn new() -> Self {
        Self {
            content: SlotContent::Empty,
            current_task: None,
        }
    }

    pub fn content(&self) -> &SlotContent<R> {
        &self.content
    }

    pub fn current_task(&self) -> Option<&Arc<LoadTask<K>>> {
        self.current_task.as_ref()
    }

    pub(crate) fn show(&mut self, content: SlotContent<R>) {
        self.content = content;
    }

    /// Whether `id` is the task currently bound to this slot.
    pub fn is_bound_to(&self, id: TaskId) -> bool {
        self.current_task.as_ref().is_some_and(|task| task.id() == id)
    }

    /// Binds `task` to this slot, cancelling and returning the task it replaces.
    pub(crate) fn bind(&mut self, task: Arc<LoadTask<K>>) -> Option<Arc<LoadTask<K>>> {
        let previous = self.current_task.replace(task);
        if let Some(previous) = &previous {
            previous.cancel();
        }
        previous
    }

    /// Removes the current binding without cancelling the task.
    pub(crate) fn unbind(&mut self) -> Option<Arc<LoadTask<K>>> {
        self.current_task.take()
    }
}

impl<K: PartialEq, R> Slot<K, R> {
    /// Whether the bound task is already loading `key`, in which case a new request for the same
    /// key is coalesced into it.
    pub fn is_loading(&self, key: &K) -> bool {
        self.current_task
            .as_ref()
            .is_some_and(|task| task.is_loading(key))
    }
}

impl<K: fmt::Debug, R: fmt::Debug> fmt::Debug for Slot<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("content", &self.content)
            .field("current_task", &self.current_task)
            .finish()
    }
}

struct Entry<K, R> {
    generation: u32,
    slot: Option<Slot<K, R>>,
}

/// Generational storage for [`Slot`]s.
pub struct SlotTable<K, R> {
    entries: Vec<Entry<K, R>>,
    free: Vec<u32>,
}

impl<K, R> Default for SlotTable<K, R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<K, R> SlotTable<K, R> {
    /// Creates a new, empty slot.
    pub fn insert(&mut self) -> SlotId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Some(Slot::new());
            return SlotId {
                index,
                generation: entry.generation,
            };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            slot: Some(Slot::new()),
        });
        SlotId {
            index,
            generation: 0,
        }
    }

    /// Removes a slot, returning it if `id` was still valid.
    pub fn remove(&mut self, id: SlotId) -> Option<Slot<K, R>> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(slot)
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot<K, R>> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot<K, R>> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_mut()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// The number of live slots.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
