// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity object tables with generational handles.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

/// Names an object stored in an `Arena<T, N>`.
///
/// A handle is a slot index plus the generation the slot had when the object
/// was inserted. Removing the object bumps the slot's generation, so a stale
/// handle can never reach whatever gets stored in the slot next.
pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot number of this handle. Stable for the object's lifetime.
    pub fn index(self) -> usize {
        usize::from(self.index)
    }

    /// Generation of the slot at the time the object was inserted.
    pub fn generation(self) -> u16 {
        self.generation
    }
}

// These are written out by hand because derive would demand the same traits
// of `T`, which a handle doesn't actually contain.
impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

/// Error returned by `Arena::insert` when every slot is taken. Gives the
/// value back.
#[derive(Debug, Eq, PartialEq)]
pub struct Full<T>(pub T);

enum Slot<T> {
    Occupied { generation: u16, value: T },
    Vacant { generation: u16, next_free: Option<u16> },
}

/// A table of up to `N` objects of type `T`.
///
/// Slots are created lazily, so an empty arena costs only its header. Freed
/// slots go on a free list and are reused before fresh ones.
pub struct Arena<T, const N: usize> {
    slots: heapless::Vec<Slot<T>, N>,
    free_head: Option<u16>,
    len: usize,
}

impl<T, const N: usize> Arena<T, N> {
    /// Handles store their index in a `u16`.
    const CAPACITY_FITS: () = assert!(N <= u16::MAX as usize);

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_FITS;
        Self {
            slots: heapless::Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Stores `value` and returns a handle to it, or gives it back if the
    /// arena is full.
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, Full<T>> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[usize::from(index)];
            let (generation, next_free) = match *slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (generation, next_free),
                // The free list only ever threads through vacant slots.
                Slot::Occupied { .. } => panic!("arena free list corrupt"),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            self.len += 1;
            return Ok(Handle::new(index, generation));
        }

        let index = self.slots.len() as u16;
        match self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        }) {
            Ok(()) => {
                self.len += 1;
                Ok(Handle::new(index, 0))
            }
            Err(Slot::Occupied { value, .. }) => Err(Full(value)),
            Err(Slot::Vacant { .. }) => unreachable!(),
        }
    }

    /// Removes the object named by `handle`, returning it. Returns `None` if
    /// the handle is stale, which lets callers detect double frees.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        match slot {
            Slot::Occupied { generation, .. }
                if *generation == handle.generation =>
            {
                let vacant = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                    next_free: self.free_head,
                };
                let old = core::mem::replace(slot, vacant);
                self.free_head = Some(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index())? {
            Slot::Occupied { generation, value }
                if *generation == handle.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index())? {
            Slot::Occupied { generation, value }
                if *generation == handle.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    /// Gets mutable references to two distinct objects at once. Returns
    /// `None` if either handle is stale or they name the same object.
    pub fn get2_mut(
        &mut self,
        a: Handle<T>,
        b: Handle<T>,
    ) -> Option<(&mut T, &mut T)> {
        if a.index == b.index || !self.contains(a) || !self.contains(b) {
            return None;
        }
        let (lo, hi, swapped) = if a.index < b.index {
            (a.index(), b.index(), false)
        } else {
            (b.index(), a.index(), true)
        };
        let (left, right) = self.slots.split_at_mut(hi);
        match (&mut left[lo], &mut right[0]) {
            (
                Slot::Occupied { value: x, .. },
                Slot::Occupied { value: y, .. },
            ) => {
                if swapped {
                    Some((y, x))
                } else {
                    Some((x, y))
                }
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Returns the handle of whatever currently lives in slot `index`, if
    /// anything. This is how externally supplied IDs get turned back into
    /// handles.
    pub fn handle_at(&self, index: usize) -> Option<Handle<T>> {
        match self.slots.get(index)? {
            Slot::Occupied { generation, .. } => {
                Some(Handle::new(index as u16, *generation))
            }
            Slot::Vacant { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of objects that can still be inserted.
    pub fn free_slots(&self) -> usize {
        N - self.len
    }

    /// Iterates over live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { generation, value } => {
                Some((Handle::new(i as u16, *generation), value))
            }
            Slot::Vacant { .. } => None,
        })
    }

    /// Iterates over live objects in slot order, mutably.
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(i as u16, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of all live objects, in slot order.
    pub fn handles(&self) -> impl Iterator<Item = Handle<T>> + '_ {
        self.iter().map(|(h, _)| h)
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Indexing with a stale handle panics. Only use this where the handle being
/// live is an invariant the caller maintains.
impl<T, const N: usize> Index<Handle<T>> for Arena<T, N> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(v) => v,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

impl<T, const N: usize> IndexMut<Handle<T>> for Arena<T, N> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.get_mut(handle) {
            Some(v) => v,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}
