//! In-memory heaps backing run formation and k-way merging.

use std::cmp::Ordering;
use std::mem;

use crate::error::{Error, Result};

/// A binary min-heap with a fixed capacity, used where the number of resident
/// items is part of a memory budget.
pub struct OverflowHeap<T, C> {
    items: Vec<T>,
    capacity: usize,
    cmp: C,
}

impl<T, C> OverflowHeap<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    /// Creates a heap holding at most `capacity` items.
    pub fn new(capacity: usize, cmp: C) -> Self {
        OverflowHeap {
            items: Vec::with_capacity(capacity),
            capacity,
            cmp,
        }
    }

    /// Memory held by a heap of the given capacity.
    pub fn memory_usage(capacity: usize) -> usize {
        mem::size_of::<Self>() + capacity * mem::size_of::<T>()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// The smallest item, if any.
    pub fn top(&self) -> Option<&T> {
        self.items.first()
    }

    /// Inserts an item. Fails with `Capacity` when the heap is full.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.is_full() {
            return Err(Error::Capacity(format!(
                "overflow heap holds its maximum of {} items",
                self.capacity
            )));
        }
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
        Ok(())
    }

    /// Removes and returns the smallest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let item = self.items.pop();
        self.sift_down(0);
        return item;
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.cmp)(&self.items[a], &self.items[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < self.items.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.items.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.items.swap(idx, smallest);
            idx = smallest;
        }
    }
}

/// A binary min-heap over `(item, run)` pairs, ordered by the comparator on
/// the item with the run index as a deterministic tie-breaker.
///
/// The items and their run tags are kept in paired arrays; `pop_and_push`
/// replaces the root and restores heap order with a single sift-down, the
/// common pattern when refilling from the run that just produced the minimum.
pub struct MergeHeap<T, C> {
    items: Vec<T>,
    runs: Vec<usize>,
    cmp: C,
}

impl<T, C> MergeHeap<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    /// Creates a heap sized for `fanout` source runs.
    pub fn new(fanout: usize, cmp: C) -> Self {
        MergeHeap {
            items: Vec::with_capacity(fanout),
            runs: Vec::with_capacity(fanout),
            cmp,
        }
    }

    /// Memory held by a heap over `fanout` runs.
    pub fn memory_usage(fanout: usize) -> usize {
        mem::size_of::<Self>() + fanout * (mem::size_of::<T>() + mem::size_of::<usize>())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The smallest item, if any.
    pub fn top(&self) -> Option<&T> {
        self.items.first()
    }

    /// The run that produced the smallest item, if any.
    pub fn top_run(&self) -> Option<usize> {
        self.runs.first().copied()
    }

    /// Inserts an item tagged with its source run.
    pub fn push(&mut self, item: T, run: usize) {
        self.items.push(item);
        self.runs.push(run);
        self.sift_up(self.items.len() - 1);
    }

    /// Removes and returns the smallest item and its run.
    pub fn pop(&mut self) -> Option<(T, usize)> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        self.runs.swap(0, last);
        let entry = self.items.pop().zip(self.runs.pop());
        self.sift_down(0);
        return entry;
    }

    /// Removes the smallest item and inserts a replacement in one sift-down.
    /// On an empty heap the replacement is simply inserted and `None` returned.
    pub fn pop_and_push(&mut self, item: T, run: usize) -> Option<(T, usize)> {
        if self.items.is_empty() {
            self.push(item, run);
            return None;
        }
        let out = (
            mem::replace(&mut self.items[0], item),
            mem::replace(&mut self.runs[0], run),
        );
        self.sift_down(0);
        return Some(out);
    }

    fn less(&self, a: usize, b: usize) -> bool {
        match (self.cmp)(&self.items[a], &self.items[b]) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.runs[a] < self.runs[b],
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.items.swap(idx, parent);
            self.runs.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < self.items.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.items.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.items.swap(idx, smallest);
            self.runs.swap(idx, smallest);
            idx = smallest;
        }
    }
}
