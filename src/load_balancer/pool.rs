//! Backend priority pool.
//!
//! # Responsibilities
//! - Keep schedulable backends in a binary heap, best candidate on top
//! - Store each element's heap position inside the element itself, so the
//!   scheduler can re-sort or remove a backend it holds a handle to
//! - Mark elements that leave the heap with [`NOT_IN_POOL`]

use std::sync::Arc;

/// Heap index of an element that is not in any pool.
pub const NOT_IN_POOL: usize = usize::MAX;

/// An element that remembers its own position in a [`Pool`].
pub trait HeapIndexed {
    fn heap_index(&self) -> usize;
    fn set_heap_index(&self, index: usize);
}

impl<T: HeapIndexed + ?Sized> HeapIndexed for Arc<T> {
    fn heap_index(&self) -> usize {
        (**self).heap_index()
    }

    fn set_heap_index(&self, index: usize) {
        (**self).set_heap_index(index)
    }
}

/// Binary min-heap ordered by `less`.
pub struct Pool<T> {
    items: Vec<T>,
    less: fn(&T, &T) -> bool,
}

impl<T: HeapIndexed> Pool<T> {
    pub fn new(less: fn(&T, &T) -> bool) -> Self {
        Self {
            items: Vec::new(),
            less,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Top of the heap without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    /// Elements in heap order (not sorted).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn push(&mut self, item: T) {
        let index = self.items.len();
        item.set_heap_index(index);
        self.items.push(item);
        self.up(index);
    }

    /// Remove and return the top element.
    pub fn pop(&mut self) -> Option<T> {
        let last = self.items.len().checked_sub(1)?;
        self.swap(0, last);
        self.down(0, last);
        self.take_last()
    }

    /// Remove the element at `index`. Returns `None` for an out of range index.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let last = self.items.len().checked_sub(1)?;
        if index > last {
            return None;
        }
        if index != last {
            self.swap(index, last);
            if !self.down(index, last) {
                self.up(index);
            }
        }
        self.take_last()
    }

    /// Restore heap order after the element at `index` changed its key.
    pub fn fix(&mut self, index: usize) {
        if index >= self.items.len() {
            return;
        }
        if !self.down(index, self.items.len()) {
            self.up(index);
        }
    }

    fn take_last(&mut self) -> Option<T> {
        let item = self.items.pop()?;
        item.set_heap_index(NOT_IN_POOL);
        Some(item)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.items[i].set_heap_index(i);
        self.items[j].set_heap_index(j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !(self.less)(&self.items[j], &self.items[parent]) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    /// Sift down within `items[..n]`. Returns whether the element moved.
    fn down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && (self.less)(&self.items[right], &self.items[left]) {
                child = right;
            }
            if !(self.less)(&self.items[child], &self.items[i]) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}
