// Fixed-capacity ring buffer for frame history
//
// Backs the scrolling waterfall. Once full, every push overwrites the oldest
// row. Reads always come back oldest to newest as a fresh Vec, so a snapshot
// handed to a renderer is never mutated afterwards.

use serde::{Deserialize, Serialize};

/// Metrics for buffer monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BufferMetrics {
    pub total_pushed: u64,
    pub total_overwritten: u64,
    pub current_size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct RingHistoryBuffer<T: Clone> {
    rows: Vec<T>,
    capacity: usize,
    /// Index of the next write slot once the buffer is full
    head: usize,
    total_pushed: u64,
    total_overwritten: u64,
}

impl<T: Clone> RingHistoryBuffer<T> {
    /// A zero capacity buffer keeps nothing
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            total_pushed: 0,
            total_overwritten: 0,
        }
    }

    pub fn push(&mut self, row: T) {
        if self.capacity == 0 {
            return;
        }

        self.total_pushed += 1;

        if self.rows.len() < self.capacity {
            self.rows.push(row);
            self.head = self.rows.len() % self.capacity;
        } else {
            self.rows[self.head] = row;
            self.head = (self.head + 1) % self.capacity;
            self.total_overwritten += 1;
        }
    }

    /// Resize, keeping the newest `min(len, capacity)` rows in arrival order
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity == self.capacity {
            return;
        }

        let mut ordered = self.linearized();
        let dropped = ordered.len().saturating_sub(capacity);
        ordered.drain(..dropped);

        self.rows = ordered;
        self.rows.reserve(capacity.saturating_sub(self.rows.len()));
        self.capacity = capacity;
        self.head = if capacity == 0 {
            0
        } else {
            self.rows.len() % capacity
        };
    }

    /// Rows oldest to newest
    pub fn linearized(&self) -> Vec<T> {
        if self.rows.len() < self.capacity || self.head == 0 {
            return self.rows.clone();
        }

        let mut ordered = Vec::with_capacity(self.rows.len());
        ordered.extend_from_slice(&self.rows[self.head..]);
        ordered.extend_from_slice(&self.rows[..self.head]);
        ordered
    }

    /// Most recently pushed row
    pub fn newest(&self) -> Option<&T> {
        if self.rows.is_empty() {
            return None;
        }
        if self.rows.len() < self.capacity {
            self.rows.last()
        } else {
            let index = (self.head + self.capacity - 1) % self.capacity;
            self.rows.get(index)
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.head = 0;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_metrics(&self) -> BufferMetrics {
        BufferMetrics {
            total_pushed: self.total_pushed,
            total_overwritten: self.total_overwritten,
            current_size: self.rows.len(),
            capacity: self.capacity,
        }
    }
}
