//! Fixed-capacity FIFO window

use std::collections::VecDeque;

/// Time-ordered window of the most recent samples.
///
/// Never holds more than `capacity` items; pushing into a full window
/// evicts the oldest.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted one if the window was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Age out the oldest sample
    pub fn pop_oldest(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// More than half full
    pub fn is_populated(&self) -> bool {
        self.items.len() > self.capacity / 2
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl RollingWindow<f32> {
    /// Arithmetic mean, None when empty
    pub fn mean(&self) -> Option<f32> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.items.iter().sum::<f32>() / self.items.len() as f32)
    }
}
