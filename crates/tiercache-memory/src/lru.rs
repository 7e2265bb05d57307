//! Recency index for the memory tier
//!
//! A doubly linked list stored in an arena of slots. Links are slot indices
//! rather than pointers, so there is no shared ownership between nodes and
//! every operation (push, touch, remove, pop) is O(1).
//!
//! ```text
//!  head (most recent)                          tail (least recent)
//!  ┌─────┐  next  ┌─────┐  next  ┌─────┐
//!  │  c  │ ─────▶ │  b  │ ─────▶ │  a  │
//!  │     │ ◀───── │     │ ◀───── │     │
//!  └─────┘  prev  └─────┘  prev  └─────┘
//! ```
//!
//! Order is defined purely by operation order: the index has no notion of
//! time, so two touches are ordered by which one ran last.

/// Stable handle to a node in a [`RecencyIndex`]
///
/// A handle stays valid until its node is removed. After that the slot may be
/// reused by a later push, so owners must drop handles together with nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena backed doubly linked recency list
#[derive(Debug)]
pub struct RecencyIndex<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for RecencyIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecencyIndex<T> {
    /// Create an empty index
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of linked nodes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the index is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a new node at the head (most recently used)
    pub fn push_front(&mut self, value: T) -> NodeId {
        let slot = Slot {
            value: Some(value),
            prev: None,
            next: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        };
        self.link_front(idx);
        self.len += 1;
        NodeId(idx)
    }

    /// Move a node to the head
    ///
    /// Returns false if the handle does not refer to a live node.
    pub fn touch(&mut self, id: NodeId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        if self.head != Some(id.0) {
            self.unlink(id.0);
            self.link_front(id.0);
        }
        true
    }

    /// Unlink a node and return its value
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if !self.is_live(id) {
            return None;
        }
        self.unlink(id.0);
        self.release_slot(id.0)
    }

    /// Unlink and return the tail (least recently used) node
    pub fn pop_back(&mut self) -> Option<T> {
        let idx = self.tail?;
        self.unlink(idx);
        self.release_slot(idx)
    }

    /// Peek at the least recently used value
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        self.tail.and_then(|idx| self.slots[idx].value.as_ref())
    }

    /// Peek at the most recently used value
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.head.and_then(|idx| self.slots[idx].value.as_ref())
    }

    /// Borrow a node's value
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id.0).and_then(|slot| slot.value.as_ref())
    }

    /// Mutably borrow a node's value without changing its position
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id.0).and_then(|slot| slot.value.as_mut())
    }

    /// Iterate from most to least recently used
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            index: self,
            cursor: self.head,
        }
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.slots.get(id.0).is_some_and(|slot| slot.value.is_some())
    }

    fn link_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        match self.head {
            Some(old) => self.slots[old].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn release_slot(&mut self, idx: usize) -> Option<T> {
        let value = self.slots[idx].value.take();
        if value.is_some() {
            self.free.push(idx);
            self.len -= 1;
        }
        value
    }
}

/// Iterator over a [`RecencyIndex`], head to tail
pub struct Iter<'a, T> {
    index: &'a RecencyIndex<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let slot = &self.index.slots[idx];
        self.cursor = slot.next;
        slot.value.as_ref()
    }
}
