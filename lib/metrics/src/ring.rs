use crate::error::{MetricsError, Result};
use core::fmt;

/// A fixed-capacity ring that keeps the most recent `capacity` items.
///
/// Pushing into a full ring overwrites (and returns) the oldest item. Lookups
/// run newest to oldest, which is the cheap direction for mostly in-order feeds.
pub struct BoundedRing<T> {
    slots: Vec<Option<T>>,
    /// Index the next push writes to.
    head: usize,
    len: usize,
}

impl<T> BoundedRing<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MetricsError::InvalidCapacity);
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Appends `item`, returning the item it displaced when the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = self.slots[self.head].replace(item);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        evicted
    }

    /// Slot index of the `nth` newest item (0 = most recent).
    fn index_of_newest(&self, nth: usize) -> usize {
        let capacity = self.capacity();
        (self.head + capacity - 1 - nth) % capacity
    }

    pub fn newest(&self) -> Option<&T> {
        self.iter_newest().next()
    }

    /// Iterates from the most recently pushed item to the oldest retained one.
    pub fn iter_newest(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |nth| self.slots[self.index_of_newest(nth)].as_ref())
    }

    /// Iterates from the oldest retained item to the most recent one.
    pub fn iter_oldest(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len)
            .rev()
            .filter_map(move |nth| self.slots[self.index_of_newest(nth)].as_ref())
    }

    /// Returns the newest item matching `predicate`.
    pub fn find_newest_mut<P>(&mut self, mut predicate: P) -> Option<&mut T>
    where
        P: FnMut(&T) -> bool,
    {
        for nth in 0..self.len {
            let index = self.index_of_newest(nth);
            if self.slots[index].as_ref().map_or(false, &mut predicate) {
                return self.slots[index].as_mut();
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

impl<T: fmt::Debug> fmt::Debug for BoundedRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("items", &self.iter_oldest().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: fmt::Display> fmt::Display for BoundedRing<T> {
    // BoundedRing (2/3)
    //  [0] oldest
    //  [1] newest
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BoundedRing ({}/{})", self.len, self.capacity())?;
        for (position, item) in self.iter_oldest().enumerate() {
            writeln!(f, " [{}] {}", position, item)?;
        }
        Ok(())
    }
}
