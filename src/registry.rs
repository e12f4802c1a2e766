//! Named runtime-instance registry as an explicit handle table: an arena
//! of slots with generation counters. A released handle can never
//! resurrect a later occupant of its slot.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Index plus generation; stale generations fail lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

struct RegistryState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    names: HashMap<String, Handle>,
}

pub struct Registry<T> {
    state: Mutex<RegistryState<T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: Vec::new(),
                free: Vec::new(),
                names: HashMap::new(),
            }),
        }
    }

    /// Register `value` under `name`. Re-registering a name releases the
    /// previous occupant and returns it.
    pub fn register(&self, name: impl Into<String>, value: T) -> (Handle, Option<T>) {
        let name = name.into();
        let mut state = self.state.lock();

        let previous = state
            .names
            .get(&name)
            .copied()
            .and_then(|handle| Self::release_slot(&mut state, handle));

        let index = match state.free.pop() {
            Some(index) => {
                state.slots[index].value = Some(value);
                index
            }
            None => {
                state.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                state.slots.len() - 1
            }
        };
        let handle = Handle {
            index,
            generation: state.slots[index].generation,
        };
        state.names.insert(name, handle);
        (handle, previous)
    }

    /// Value behind a handle, unless the slot has been released or
    /// recycled since.
    pub fn get(&self, handle: Handle) -> Option<T> {
        let state = self.state.lock();
        let slot = state.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    pub fn lookup(&self, name: &str) -> Option<Handle> {
        self.state.lock().names.get(name).copied()
    }

    /// Release a handle, bumping the slot generation so stale handles go
    /// dead. Returns the released value.
    pub fn release(&self, handle: Handle) -> Option<T> {
        let mut state = self.state.lock();
        let released = Self::release_slot(&mut state, handle)?;
        state.names.retain(|_, h| *h != handle);
        Some(released)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.slots.len() - state.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_slot(state: &mut RegistryState<T>, handle: Handle) -> Option<T> {
        let slot = state.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation += 1;
        state.free.push(handle.index);
        Some(value)
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry: Registry<i32> = Registry::new();
        let (handle, previous) = registry.register("main", 7);
        assert!(previous.is_none());
        assert_eq!(registry.get(handle), Some(7));
        assert_eq!(registry.lookup("main"), Some(handle));
    }

    #[test]
    fn test_release_invalidates_handle() {
        let registry: Registry<i32> = Registry::new();
        let (handle, _) = registry.register("main", 7);
        assert_eq!(registry.release(handle), Some(7));
        assert_eq!(registry.get(handle), None);
        assert_eq!(registry.lookup("main"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_recycled_slot_gets_new_generation() {
        let registry: Registry<i32> = Registry::new();
        let (old, _) = registry.register("a", 1);
        registry.release(old);
        let (new, _) = registry.register("b", 2);
        // Same arena slot, different generation.
        assert_eq!(registry.get(old), None);
        assert_eq!(registry.get(new), Some(2));
        assert_ne!(old, new);
    }

    #[test]
    fn test_reregister_replaces_previous() {
        let registry: Registry<i32> = Registry::new();
        let (first, _) = registry.register("main", 1);
        let (second, previous) = registry.register("main", 2);
        assert_eq!(previous, Some(1));
        assert_eq!(registry.get(first), None);
        assert_eq!(registry.get(second), Some(2));
        assert_eq!(registry.lookup("main"), Some(second));
    }

    #[test]
    fn test_double_release_is_noop() {
        let registry: Registry<i32> = Registry::new();
        let (handle, _) = registry.register("main", 1);
        assert_eq!(registry.release(handle), Some(1));
        assert_eq!(registry.release(handle), None);
    }
}
