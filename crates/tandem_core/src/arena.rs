//! Generational arena for engine-owned values
//!
//! Every value the engine hands out a reference to (host objects wrapped for
//! script, captured script values, execution contexts) lives in an arena slot.
//! Host-side wrappers keep only the [`Handle`]; freeing the slot bumps its
//! generation so stale wrappers are rejected instead of dereferenced.

use crate::handle::Handle;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("handle {handle} is stale (slot now at generation {current})")]
    Stale { handle: Handle, current: u32 },

    #[error("handle {handle} is out of bounds (arena has {len} slots)")]
    OutOfBounds { handle: Handle, len: usize },
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

/// Slot storage with free-list reuse and generation checks.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation();
            *slot = Slot::Occupied { generation, value };
            return Handle::new(index, generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Handle::new(index, 0)
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>, ArenaError> {
        self.slots
            .get(handle.index() as usize)
            .ok_or(ArenaError::OutOfBounds {
                handle,
                len: self.slots.len(),
            })
    }

    pub fn get(&self, handle: Handle) -> Result<&T, ArenaError> {
        match self.slot(handle)? {
            Slot::Occupied { generation, value } if *generation == handle.generation() => Ok(value),
            other => Err(ArenaError::Stale {
                handle,
                current: other.generation(),
            }),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, ArenaError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .ok_or(ArenaError::OutOfBounds { handle, len })?;
        let current = slot.generation();
        match slot {
            Slot::Occupied { generation, value } if *generation == handle.generation() => Ok(value),
            _ => Err(ArenaError::Stale { handle, current }),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Free a slot and return its value. The slot's generation is bumped so
    /// `handle` (and any copy of it) is stale from now on.
    pub fn remove(&mut self, handle: Handle) -> Result<T, ArenaError> {
        self.get(handle)?;
        let index = handle.index() as usize;
        let next = handle.generation().wrapping_add(1);
        let old = std::mem::replace(&mut self.slots[index], Slot::Vacant { generation: next });
        self.free.push(handle.index());
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Ok(value),
            Slot::Vacant { .. } => unreachable!("slot checked occupied above"),
        }
    }

    /// Remove every value matching `pred`, returning them so the caller can
    /// drop them outside of any lock it holds.
    pub fn extract_if(&mut self, mut pred: impl FnMut(Handle, &T) -> bool) -> Vec<(Handle, T)> {
        let doomed: Vec<Handle> = self
            .iter()
            .filter(|(handle, value)| pred(*handle, value))
            .map(|(handle, _)| handle)
            .collect();
        doomed
            .into_iter()
            .filter_map(|handle| self.remove(handle).ok().map(|value| (handle, value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Ok(&"a"));
        assert_eq!(arena.remove(b), Ok("b"));
        assert_eq!(arena.len(), 1);
        assert!(!arena.contains(b));
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        arena.remove(first).unwrap();

        // Slot is reused with a new generation
        let second = arena.insert(2);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        assert_eq!(
            arena.get(first),
            Err(ArenaError::Stale {
                handle: first,
                current: second.generation()
            })
        );
        assert_eq!(arena.get(second), Ok(&2));
    }

    #[test]
    fn test_get_mut_checks_generation() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        *arena.get_mut(first).unwrap() += 10;
        assert_eq!(arena.get(first), Ok(&11));

        arena.remove(first).unwrap();
        let second = arena.insert(2);
        assert_eq!(
            arena.get_mut(first),
            Err(ArenaError::Stale {
                handle: first,
                current: second.generation()
            })
        );
        assert!(matches!(
            arena.get_mut(Handle::from_bits(9)),
            Err(ArenaError::OutOfBounds { len: 1, .. })
        ));
    }

    #[test]
    fn test_out_of_bounds() {
        let arena: Arena<u8> = Arena::new();
        let bogus = Handle::from_bits(5);
        assert!(matches!(
            arena.get(bogus),
            Err(ArenaError::OutOfBounds { len: 0, .. })
        ));
    }

    #[test]
    fn test_extract_if() {
        let mut arena = Arena::new();
        for i in 0..6 {
            arena.insert(i);
        }
        let evens = arena.extract_if(|_, v| v % 2 == 0);
        assert_eq!(evens.len(), 3);
        assert_eq!(arena.len(), 3);
        assert!(arena.iter().all(|(_, v)| v % 2 == 1));
    }

    proptest! {
        // Inserts (`Some`) and removals by position (`None`) checked
        // against a map; every removed handle must stay stale.
        #[test]
        fn test_matches_a_map(ops in prop::collection::vec(prop::option::of(any::<u8>()), 0..64)) {
            let mut arena = Arena::new();
            let mut model: HashMap<Handle, u8> = HashMap::new();
            let mut dead = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Some(value) => {
                        let handle = arena.insert(value);
                        prop_assert!(model.insert(handle, value).is_none());
                    }
                    None if !model.is_empty() => {
                        let mut live: Vec<Handle> = model.keys().copied().collect();
                        live.sort();
                        let handle = live[step % live.len()];
                        prop_assert_eq!(arena.remove(handle), Ok(model[&handle]));
                        model.remove(&handle);
                        dead.push(handle);
                    }
                    None => {}
                }
            }

            prop_assert_eq!(arena.len(), model.len());
            for (handle, value) in &model {
                prop_assert_eq!(arena.get(*handle), Ok(value));
            }
            for handle in dead {
                prop_assert!(!arena.contains(handle));
            }
        }
    }
}
