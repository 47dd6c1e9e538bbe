//! A binary heap with keyed lookup, update and removal.

use placement_core::Uid;
use std::collections::HashMap;
use std::fmt;

/// Ordering function: `less(a, b)` is true when `a` should pop before `b`.
pub type LessFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Heap of items keyed by pod uid.
pub struct Heap<T> {
    items: Vec<(Uid, T)>,
    index: HashMap<Uid, usize>,
    less: LessFn<T>,
}

impl<T: fmt::Debug> fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("items", &self.items).finish_non_exhaustive()
    }
}

impl<T> Heap<T> {
    /// Create an empty heap ordered by `less`.
    pub fn new(less: LessFn<T>) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            less,
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check whether `key` is present.
    pub fn contains(&self, key: &Uid) -> bool {
        self.index.contains_key(key)
    }

    /// Look up an item.
    pub fn get(&self, key: &Uid) -> Option<&T> {
        self.index.get(key).map(|&i| &self.items[i].1)
    }

    /// Insert an item, replacing and re-ordering any item with the same key.
    pub fn add_or_update(&mut self, key: Uid, item: T) {
        if let Some(&i) = self.index.get(&key) {
            self.items[i].1 = item;
            self.fix(i);
            return;
        }
        self.items.push((key.clone(), item));
        let last = self.items.len() - 1;
        self.index.insert(key, last);
        self.sift_up(last);
    }

    /// Remove and return an item by key.
    pub fn remove(&mut self, key: &Uid) -> Option<T> {
        let i = self.index.remove(key)?;
        let last = self.items.len() - 1;
        self.items.swap(i, last);
        let (_, item) = self.items.pop()?;
        if i < self.items.len() {
            self.index.insert(self.items[i].0.clone(), i);
            self.fix(i);
        }
        Some(item)
    }

    /// The item that pops next.
    pub fn peek(&self) -> Option<&T> {
        self.items.first().map(|(_, item)| item)
    }

    /// Remove and return the first item.
    pub fn pop(&mut self) -> Option<T> {
        let key = self.items.first()?.0.clone();
        self.remove(&key)
    }

    /// Iterate over items in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().map(|(_, item)| item)
    }

    fn fix(&mut self, i: usize) {
        if !self.sift_up(i) {
            self.sift_down(i);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.index.insert(self.items[a].0.clone(), a);
        self.index.insert(self.items[b].0.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) -> bool {
        let start = i;
        while i > 0 {
            let parent = (i - 1) / 2;
            if !(self.less)(&self.items[i].1, &self.items[parent].1) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i != start
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.items.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < n && (self.less)(&self.items[right].1, &self.items[left].1) {
                child = right;
            }
            if !(self.less)(&self.items[child].1, &self.items[i].1) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<i32> {
        Heap::new(Box::new(|a: &i32, b: &i32| a < b))
    }

    #[test]
    fn pops_in_order() {
        let mut h = heap();
        for (i, v) in [5, 3, 9, 1, 7].into_iter().enumerate() {
            h.add_or_update(Uid::new(format!("k{i}")), v);
        }
        let mut out = Vec::new();
        while let Some(v) = h.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 3, 5, 7, 9]);
        assert!(h.is_empty());
    }

    #[test]
    fn update_reorders() {
        let mut h = heap();
        h.add_or_update(Uid::new("a"), 1);
        h.add_or_update(Uid::new("b"), 2);
        h.add_or_update(Uid::new("a"), 3);
        assert_eq!(h.len(), 2);
        assert_eq!(h.peek(), Some(&2));
    }

    #[test]
    fn remove_by_key() {
        let mut h = heap();
        for (k, v) in [("a", 4), ("b", 2), ("c", 8), ("d", 6)] {
            h.add_or_update(Uid::new(k), v);
        }
        assert_eq!(h.remove(&Uid::new("b")), Some(2));
        assert_eq!(h.remove(&Uid::new("b")), None);
        assert!(!h.contains(&Uid::new("b")));
        assert_eq!(h.get(&Uid::new("c")), Some(&8));
        assert_eq!(h.pop(), Some(4));
        assert_eq!(h.pop(), Some(6));
        assert_eq!(h.pop(), Some(8));
    }
}
