//! Generational slot storage.
//!
//! Removing a value bumps its slot's generation, so an [`ArenaId`] held
//! across a removal resolves to `None` instead of to whatever value reuses
//! the slot.

use alloc::vec::Vec;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaId {
    index: u32,
    generation: u32,
}

impl ArenaId {
    /// An id that never resolves.
    #[inline]
    #[must_use]
    pub const fn dangling() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert the value `make` builds from its own id.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` slots would be needed.
    pub fn insert_with(&mut self, make: impl FnOnce(ArenaId) -> T) -> (ArenaId, &mut T) {
        let index = self.free.pop().unwrap_or_else(|| {
            let Ok(index) = u32::try_from(self.slots.len()) else {
                panic!("arena exhausted");
            };
            self.slots.push(Slot {
                generation: 0,
                value: None,
            });
            index
        });
        let slot = &mut self.slots[index as usize];
        let id = ArenaId {
            index,
            generation: slot.generation,
        };
        self.len += 1;
        (id, slot.value.insert(make(id)))
    }

    fn slot(&self, id: ArenaId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    #[must_use]
    pub fn contains(&self, id: ArenaId) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: ArenaId) -> Option<&T> {
        self.slot(id)?.value.as_ref()
    }

    pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .value
            .as_mut()
    }

    /// Take the value out; `id` and every copy of it go stale.
    pub fn remove(&mut self, id: ArenaId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> {
        self.slots.iter().zip(0u32..).filter_map(|(slot, index)| {
            let id = ArenaId {
                index,
                generation: slot.generation,
            };
            slot.value.as_ref().map(|value| (id, value))
        })
    }

    /// Ids of all live values, in slot order.
    #[must_use]
    pub fn ids(&self) -> Vec<ArenaId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Remove every value, returning them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (slot, index) in self.slots.iter_mut().zip(0u32..) {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut arena = Arena::new();
        let (a, _) = arena.insert_with(|_| "a");
        assert_eq!(arena.remove(a), Some("a"));
        let (b, _) = arena.insert_with(|_| "b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn value_sees_its_own_id() {
        let mut arena = Arena::new();
        let (id, value) = arena.insert_with(|id| id);
        assert_eq!(*value, id);
        assert!(!arena.contains(ArenaId::dangling()));
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..3).map(|i| arena.insert_with(|_| i).0).collect();
        arena.remove(ids[1]);
        assert_eq!(arena.drain(), [0, 2]);
        assert!(arena.is_empty());
        assert!(ids.iter().all(|id| !arena.contains(*id)));
        assert_eq!(arena.iter().count(), 0);
    }
}
