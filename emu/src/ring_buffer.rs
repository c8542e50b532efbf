use std::collections::VecDeque;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// A fixed-capacity history of the most recent N elements.
///
/// The interpreter keeps one of these filled with the addresses of the last
/// executed instructions so a fatal decode error can be reported together
/// with the path that led to it.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    buffer: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes an element, dropping the oldest one when full.
    pub fn push(&mut self, element: T) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(element);
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.buffer.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl RingBuffer<u32> {
    /// Formats the history as `0x........` addresses separated by `separator`.
    #[must_use]
    pub fn join_hex(&self, separator: &str) -> String {
        let mut out = String::new();
        for (i, value) in self.buffer.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            let _ = write!(out, "{value:#010x}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_buffer_is_empty() {
        let ring: RingBuffer<u32> = RingBuffer::new(10);
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);
    }

    #[test]
    fn push_over_capacity_removes_oldest() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(3);

        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.push(4);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.last(), Some(&4));
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(0);
        ring.push(1);
        assert!(ring.is_empty());
    }

    #[test]
    fn join_hex_formats_addresses() {
        let mut ring = RingBuffer::new(4);
        ring.push(0x0880_0000);
        ring.push(0x0880_0004);
        assert_eq!(ring.join_hex(" -> "), "0x08800000 -> 0x08800004");
    }
}
