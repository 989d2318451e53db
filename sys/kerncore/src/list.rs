// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive doubly-linked lists over arena handles.
//!
//! The links live inside the listed objects themselves, so putting an object
//! on a list never allocates and taking it off is O(1). An object can sit on
//! several lists at once as long as each list uses a different `Adapter`
//! (i.e. a different `Links` field).
//!
//! The `List` header is a small `Copy` value. Where the header itself lives
//! inside an arena object (a thread's queue of senders, say) the usual move is
//! to copy it out, operate on it, and store it back.

use core::marker::PhantomData;

use crate::arena::{Arena, Handle};

/// Per-object link storage for one kind of list.
pub struct Links<T> {
    prev: Option<Handle<T>>,
    next: Option<Handle<T>>,
    linked: bool,
}

impl<T> Links<T> {
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
        }
    }

    /// Checks whether the owning object is currently on a list of this kind.
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Copy for Links<T> {}

impl<T> Clone for Links<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> core::fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Links")
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("linked", &self.linked)
            .finish()
    }
}

/// Tells a `List` where in `T` to find its links.
pub trait Adapter<T> {
    fn links(item: &T) -> &Links<T>;
    fn links_mut(item: &mut T) -> &mut Links<T>;
}

/// Head of an intrusive list of objects stored in an `Arena`.
///
/// Operations panic if they meet a stale handle in the links, which can only
/// happen if the list has been corrupted.
pub struct List<T, A> {
    head: Option<Handle<T>>,
    tail: Option<Handle<T>>,
    len: usize,
    _adapter: PhantomData<fn() -> A>,
}

impl<T, A> Copy for List<T, A> {}

impl<T, A> Clone for List<T, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A> core::fmt::Debug for List<T, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("List")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<T, A> Default for List<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A> List<T, A> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _adapter: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<Handle<T>> {
        self.head
    }

    pub fn back(&self) -> Option<Handle<T>> {
        self.tail
    }
}

impl<T, A: Adapter<T>> List<T, A> {
    /// Appends `h`. Returns `false` (and does nothing) if `h` is already on a
    /// list of this kind.
    pub fn push_back<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        h: Handle<T>,
    ) -> bool {
        if A::links(&arena[h]).linked {
            return false;
        }
        let old_tail = self.tail;
        *A::links_mut(&mut arena[h]) = Links {
            prev: old_tail,
            next: None,
            linked: true,
        };
        match old_tail {
            Some(t) => A::links_mut(&mut arena[t]).next = Some(h),
            None => self.head = Some(h),
        }
        self.tail = Some(h);
        self.len += 1;
        true
    }

    /// Prepends `h`. Returns `false` (and does nothing) if `h` is already on
    /// a list of this kind.
    pub fn push_front<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        h: Handle<T>,
    ) -> bool {
        match self.head {
            None => self.push_back(arena, h),
            Some(first) => self.insert_before(arena, first, h),
        }
    }

    /// Inserts `h` right after `anchor`, which must be on this list.
    pub fn insert_after<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        anchor: Handle<T>,
        h: Handle<T>,
    ) -> bool {
        if A::links(&arena[h]).linked {
            return false;
        }
        let after = A::links(&arena[anchor]).next;
        *A::links_mut(&mut arena[h]) = Links {
            prev: Some(anchor),
            next: after,
            linked: true,
        };
        A::links_mut(&mut arena[anchor]).next = Some(h);
        match after {
            Some(n) => A::links_mut(&mut arena[n]).prev = Some(h),
            None => self.tail = Some(h),
        }
        self.len += 1;
        true
    }

    /// Inserts `h` right before `anchor`, which must be on this list.
    pub fn insert_before<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        anchor: Handle<T>,
        h: Handle<T>,
    ) -> bool {
        if A::links(&arena[h]).linked {
            return false;
        }
        let before = A::links(&arena[anchor]).prev;
        *A::links_mut(&mut arena[h]) = Links {
            prev: before,
            next: Some(anchor),
            linked: true,
        };
        A::links_mut(&mut arena[anchor]).prev = Some(h);
        match before {
            Some(p) => A::links_mut(&mut arena[p]).next = Some(h),
            None => self.head = Some(h),
        }
        self.len += 1;
        true
    }

    /// Unlinks `h`, which must be on *this* list if it is linked at all.
    /// Returns `false` if `h` wasn't linked.
    pub fn remove<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        h: Handle<T>,
    ) -> bool {
        let links = *A::links(&arena[h]);
        if !links.linked {
            return false;
        }
        match links.prev {
            Some(p) => A::links_mut(&mut arena[p]).next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(n) => A::links_mut(&mut arena[n]).prev = links.prev,
            None => self.tail = links.prev,
        }
        *A::links_mut(&mut arena[h]) = Links::new();
        self.len -= 1;
        true
    }

    pub fn pop_front<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
    ) -> Option<Handle<T>> {
        let h = self.head?;
        self.remove(arena, h);
        Some(h)
    }

    /// Moves `h`, which must be on this list, to the tail.
    pub fn rotate_to_back<const N: usize>(
        &mut self,
        arena: &mut Arena<T, N>,
        h: Handle<T>,
    ) {
        if self.remove(arena, h) {
            self.push_back(arena, h);
        }
    }

    /// Successor of `h` on its list.
    pub fn next<const N: usize>(
        arena: &Arena<T, N>,
        h: Handle<T>,
    ) -> Option<Handle<T>> {
        A::links(&arena[h]).next
    }

    /// Predecessor of `h` on its list.
    pub fn prev<const N: usize>(
        arena: &Arena<T, N>,
        h: Handle<T>,
    ) -> Option<Handle<T>> {
        A::links(&arena[h]).prev
    }

    /// Walks the list front to back.
    pub fn iter<'a, const N: usize>(
        &self,
        arena: &'a Arena<T, N>,
    ) -> Iter<'a, T, A, N> {
        Iter {
            arena,
            next: self.head,
            _adapter: PhantomData,
        }
    }
}

/// Front-to-back iterator over a `List`.
pub struct Iter<'a, T, A, const N: usize> {
    arena: &'a Arena<T, N>,
    next: Option<Handle<T>>,
    _adapter: PhantomData<fn() -> A>,
}

impl<T, A: Adapter<T>, const N: usize> Iterator for Iter<'_, T, A, N> {
    type Item = Handle<T>;

    fn next(&mut self) -> Option<Handle<T>> {
        let h = self.next?;
        self.next = A::links(&self.arena[h]).next;
        Some(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Debug)]
    struct Node {
        value: u32,
        links: Links<Node>,
    }

    struct ByLinks;

    impl Adapter<Node> for ByLinks {
        fn links(item: &Node) -> &Links<Node> {
            &item.links
        }
        fn links_mut(item: &mut Node) -> &mut Links<Node> {
            &mut item.links
        }
    }

    type TestList = List<Node, ByLinks>;

    fn node(value: u32) -> Node {
        Node {
            value,
            links: Links::new(),
        }
    }

    fn values<const N: usize>(
        list: &TestList,
        arena: &Arena<Node, N>,
    ) -> Vec<u32> {
        list.iter(arena).map(|h| arena[h].value).collect()
    }

    #[test]
    fn fifo_order_is_kept() {
        let mut arena: Arena<Node, 8> = Arena::new();
        let mut list = TestList::new();
        for v in [1, 2, 3] {
            let h = arena.insert(node(v)).unwrap();
            assert!(list.push_back(&mut arena, h));
        }
        assert_eq!(values(&list, &arena), [1, 2, 3]);
        let first = list.pop_front(&mut arena).unwrap();
        assert_eq!(arena[first].value, 1);
        assert!(!arena[first].links.is_linked());
        assert_eq!(values(&list, &arena), [2, 3]);
    }

    #[test]
    fn double_insert_is_a_no_op() {
        let mut arena: Arena<Node, 8> = Arena::new();
        let mut list = TestList::new();
        let h = arena.insert(node(7)).unwrap();
        assert!(list.push_back(&mut arena, h));
        assert!(!list.push_back(&mut arena, h), "second push must refuse");
        assert!(!list.push_front(&mut arena, h));
        assert_eq!(list.len(), 1);
        assert_eq!(values(&list, &arena), [7]);
    }

    #[test]
    fn middle_removal_and_relative_inserts() {
        let mut arena: Arena<Node, 8> = Arena::new();
        let mut list = TestList::new();
        let hs: Vec<_> = (0..4)
            .map(|v| {
                let h = arena.insert(node(v)).unwrap();
                list.push_back(&mut arena, h);
                h
            })
            .collect();
        assert!(list.remove(&mut arena, hs[1]));
        assert!(!list.remove(&mut arena, hs[1]), "already removed");
        assert_eq!(values(&list, &arena), [0, 2, 3]);

        list.insert_after(&mut arena, hs[3], hs[1]);
        assert_eq!(values(&list, &arena), [0, 2, 3, 1]);
        assert_eq!(list.back(), Some(hs[1]));

        let x = arena.insert(node(9)).unwrap();
        list.insert_before(&mut arena, hs[0], x);
        assert_eq!(values(&list, &arena), [9, 0, 2, 3, 1]);
        assert_eq!(list.front(), Some(x));

        list.rotate_to_back(&mut arena, x);
        assert_eq!(values(&list, &arena), [0, 2, 3, 1, 9]);
        assert_eq!(TestList::prev(&arena, x), Some(hs[1]));
        assert_eq!(TestList::next(&arena, x), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        PushBack,
        PushFront,
        PopFront,
        Remove(usize),
        Rotate(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::PushBack),
            Just(Op::PushFront),
            Just(Op::PopFront),
            (0usize..16).prop_map(Op::Remove),
            (0usize..16).prop_map(Op::Rotate),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_deque(ops in proptest::collection::vec(op(), 0..200)) {
            let mut arena: Arena<Node, 16> = Arena::new();
            let mut list = TestList::new();
            let mut model: VecDeque<Handle<Node>> = VecDeque::new();
            let mut counter = 0;

            for op in ops {
                match op {
                    Op::PushBack | Op::PushFront => {
                        counter += 1;
                        if let Ok(h) = arena.insert(node(counter)) {
                            if matches!(op, Op::PushBack) {
                                list.push_back(&mut arena, h);
                                model.push_back(h);
                            } else {
                                list.push_front(&mut arena, h);
                                model.push_front(h);
                            }
                        }
                    }
                    Op::PopFront => {
                        let got = list.pop_front(&mut arena);
                        prop_assert_eq!(got, model.pop_front());
                        if let Some(h) = got {
                            arena.remove(h);
                        }
                    }
                    Op::Remove(i) => {
                        if i < model.len() {
                            let h = model.remove(i).unwrap();
                            prop_assert!(list.remove(&mut arena, h));
                            arena.remove(h);
                        }
                    }
                    Op::Rotate(i) => {
                        if i < model.len() {
                            let h = model.remove(i).unwrap();
                            list.rotate_to_back(&mut arena, h);
                            model.push_back(h);
                        }
                    }
                }
                let walked: Vec<_> = list.iter(&arena).collect();
                let expected: Vec<_> = model.iter().copied().collect();
                prop_assert_eq!(walked, expected);
                prop_assert_eq!(list.len(), model.len());
                prop_assert_eq!(list.back(), model.back().copied());
            }
        }
    }
}
